//! Field policy tables.
//!
//! One explicit table per record kind. A field missing from its table is
//! schema drift and stops the run; see [`super::FieldMerger`].

use serde_json::Value;

use crate::models::RecordKind;

/// How an incoming value for a field combines with the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldAction {
    /// Incoming value always replaces.
    Overwrite,
    /// Replace unless the incoming value is an empty sentinel.
    OverwriteIfIncomingNonEmpty,
    /// Replace only when the stored value is an empty sentinel.
    OverwriteIfExistingEmpty,
    /// First observation wins.
    NeverOverwrite,
    /// Stripped at ingest, ignored on merge.
    DeleteOnIngest,
    /// Field-specific handling in the merger.
    SpecialRule,
    /// Viewer/moderator-specific field, reset to a blank value at ingest.
    SpecialNoOverwrite,
    /// Accepted verbatim.
    AllowAsIs,
    /// Only ever expected to be empty.
    AllowOnlyIfEmpty,
}

/// Look up the policy for `field` on records of `kind`.
pub fn field_action(kind: RecordKind, field: &str) -> Option<FieldAction> {
    match kind {
        RecordKind::Comment => comment_action(field),
        RecordKind::Submission => submission_action(field),
    }
}

fn comment_action(field: &str) -> Option<FieldAction> {
    match field {
        "_meta" | "archived" | "author_patreon_flair" | "author_premium" | "can_gild" |
        "collapsed" | "collapsed_reason" | "collapsed_reason_code" | "controversiality" |
        "distinguished" | "editable" | "locked" | "media_metadata" | "no_follow" |
        "score_hidden" | "send_replies" | "stickied" => Some(FieldAction::Overwrite),
        "all_awardings" | "body_sha1" | "comment_type" | "edited" | "expression_asset_data" |
        "gilded" | "gildings" | "likes" | "nest_level" | "rte_mode" | "subreddit" |
        "subreddit_id" | "subreddit_name_prefixed" | "total_awards_received" |
        "treatment_tags" | "unrepliable_reason" | "ups" => Some(FieldAction::OverwriteIfIncomingNonEmpty),
        "author" | "author_flair_background_color" | "author_flair_css_class" |
        "author_flair_richtext" | "author_flair_template_id" | "author_flair_text" |
        "author_flair_text_color" | "author_flair_type" | "author_fullname" | "awarders" |
        "created" | "created_utc" | "downs" | "name" | "parent_id" | "replies" => Some(FieldAction::OverwriteIfExistingEmpty),
        "author_cakeday" | "is_submitter" | "permalink" | "subreddit_type" => Some(FieldAction::NeverOverwrite),
        "approved" | "ban_note" | "body_html" | "ignore_reports" | "removed" | "spam" |
        "utc_datetime_str" => Some(FieldAction::DeleteOnIngest),
        "body" | "removal_reason" | "retrieved_on" | "retrieved_utc" | "score" | "updated_on" |
        "updated_utc" => Some(FieldAction::SpecialRule),
        "approved_at_utc" | "approved_by" | "author_is_blocked" | "banned_at_utc" |
        "banned_by" | "can_mod_post" | "mod_reason_by" | "mod_reason_title" | "mod_reports" |
        "mod_reports_dismissed" | "num_reports" | "report_reasons" | "saved" | "user_reports" |
        "user_reports_dismissed" => Some(FieldAction::SpecialNoOverwrite),
        "edited_on" | "id" | "link_id" | "previous_body" => Some(FieldAction::AllowAsIs),
        "associated_award" | "collapsed_because_crowd_control" | "mod_note" |
        "top_awarded_type" => Some(FieldAction::AllowOnlyIfEmpty),
        _ => None,
    }
}

// Of the two submission tables that circulated, this is the newer one (it
// carries `_meta`, `ad_business` and the `score` special rule).
fn submission_action(field: &str) -> Option<FieldAction> {
    match field {
        "_meta" | "allow_live_comments" | "author_patreon_flair" | "author_premium" |
        "call_to_action" | "can_gild" | "contest_mode" | "distinguished" | "edited" |
        "hide_score" | "is_crosspostable" | "is_meta" | "is_original_content" |
        "is_reddit_media_domain" | "is_robot_indexable" | "is_video" | "locked" |
        "media_only" | "no_follow" | "num_crossposts" | "over_18" | "parent_whitelist_status" |
        "post_hint" | "promo_layout" | "pwls" | "removed_by_category" | "send_replies" |
        "spoiler" | "stickied" | "subcaption" | "suggested_sort" | "top_awarded_type" |
        "upvote_ratio" | "whitelist_status" | "wls" => Some(FieldAction::Overwrite),
        "ad_business" | "ad_promoted_user_posts" | "ad_supplementary_text_md" |
        "ad_user_targeting" | "all_awardings" | "author_flair_background_color" |
        "author_flair_css_class" | "author_flair_richtext" | "author_flair_template_id" |
        "author_flair_text" | "author_flair_text_color" | "author_flair_type" |
        "author_fullname" | "author_id" | "category" | "collections" | "crosspost_parent" |
        "crosspost_parent_list" | "discussion_type" | "domain" | "domain_override" |
        "embed_type" | "embed_url" | "event_end" | "event_is_live" | "event_start" |
        "gallery_data" | "gilded" | "gildings" | "is_created_from_ads_ui" | "is_gallery" |
        "likes" | "link_flair_background_color" | "link_flair_css_class" |
        "link_flair_richtext" | "link_flair_template_id" | "link_flair_text" |
        "link_flair_text_color" | "link_flair_type" | "media" | "media_embed" |
        "media_metadata" | "mobile_ad_url" | "num_comments" | "poll_data" | "preview" |
        "rte_mode" | "secure_media" | "secure_media_embed" | "subreddit" | "subreddit_id" |
        "subreddit_name_prefixed" | "thumbnail" | "thumbnail_height" | "thumbnail_width" |
        "total_awards_received" | "treatment_tags" | "tournament_data" | "unrepliable_reason" |
        "ups" | "url" | "url_overridden_by_dest" => Some(FieldAction::OverwriteIfIncomingNonEmpty),
        "author" | "created" | "created_utc" | "name" | "subreddit_subscribers" => Some(FieldAction::OverwriteIfExistingEmpty),
        "author_cakeday" | "href_url" | "is_self" | "permalink" | "quarantine" |
        "subreddit_type" | "title" => Some(FieldAction::NeverOverwrite),
        "approved" | "ban_note" | "ignore_reports" | "removed" | "selftext_html" | "spam" |
        "utc_datetime_str" => Some(FieldAction::DeleteOnIngest),
        "removal_reason" | "retrieved_on" | "retrieved_utc" | "score" | "selftext" |
        "updated_on" | "updated_utc" => Some(FieldAction::SpecialRule),
        "approved_at_utc" | "approved_by" | "author_is_blocked" | "banned_at_utc" |
        "banned_by" | "can_mod_post" | "clicked" | "downs" | "hidden" | "mod_note" |
        "mod_reason_by" | "mod_reason_title" | "mod_reports" | "mod_reports_dismissed" |
        "num_reports" | "removed_by" | "report_reasons" | "saved" | "user_reports" |
        "user_reports_dismissed" | "visited" => Some(FieldAction::SpecialNoOverwrite),
        "content_categories" | "edited_on" | "id" | "previous_selftext" | "show_media" => Some(FieldAction::AllowAsIs),
        "adserver_click_url" | "adserver_imp_pixel" | "app_store_data" | "archived" |
        "awarders" | "campaign_id" | "events" | "eventsOnRender" | "impression_id" |
        "impression_id_str" | "is_blank" | "is_survey_ad" | "original_link" | "outbound_link" |
        "pinned" | "priority_id" | "product_ids" | "promoted" | "promoted_by" |
        "promoted_display_name" | "promoted_url" | "sk_ad_network_data" |
        "third_party_trackers" | "third_party_tracking" | "third_party_tracking_2" |
        "view_count" => Some(FieldAction::AllowOnlyIfEmpty),
        _ => None,
    }
}

/// Canonical blank value for a [`FieldAction::SpecialNoOverwrite`] field.
///
/// These fields describe the capturing account's view (saved, hidden, mod
/// queues) rather than the record, so they are normalized at ingest.
pub fn special_blank(field: &str) -> Option<Value> {
    match field {
        "can_mod_post" | "saved" | "clicked" | "visited" | "author_is_blocked" | "hidden" => {
            Some(Value::Bool(false))
        }
        "banned_at_utc" | "banned_by" | "approved_at_utc" | "approved_by"
        | "user_reports_dismissed" | "mod_reports_dismissed" | "removed_by" | "mod_note"
        | "mod_reason_by" | "mod_reason_title" => Some(Value::Null),
        "num_reports" | "downs" => Some(Value::from(0)),
        "report_reasons" | "user_reports" | "mod_reports" => Some(Value::Array(Vec::new())),
        _ => None,
    }
}
