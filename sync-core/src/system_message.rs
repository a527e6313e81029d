//! Classification of system events embedded in message text.
//!
//! The server announces team membership changes and invitation/application
//! outcomes by posting ordinary messages whose text follows fixed templates:
//! a leading glyph, then either a prose sentence or an upper-case marker with
//! `|`-delimited fields. Any text matching none of them is a plain message.
//!
//! Templates are tried in a fixed priority order and the first structural
//! match wins. Parsing never fails: malformed text degrades to `None`.
//! Drift in the server's wording silently turns events into plain messages,
//! so changes here must be coordinated with the message generator.

use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

static TEAM_JOIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)^👋 ([^\n]+?) joined the team!(?:\n\n"(.*)")?$"#).expect("valid regex")
});

static INVITATION_RESPONSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)^📋 Response to your invitation for "([^"\n]+)":\n\n"(.*)"$"#)
        .expect("valid regex")
});

static APPLICATION_APPROVED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?s)^🎉 Your application to join "([^"\n]+)" has been approved!(?:\n\n"(.*)")?$"#,
    )
    .expect("valid regex")
});

static APPLICATION_RESPONSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)^📝 Response to your application for "([^"\n]+)":\n\n"(.*)"$"#)
        .expect("valid regex")
});

static TEAM_LEAVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^🚪 ([^\n]+?) has left the team\.$").expect("valid regex"));

static APPLICATION_DECLINED: LazyLock<Regex> = LazyLock::new(|| structured("🚫", "APPLICATION_DECLINED"));

static APPLICATION_APPROVED_DM: LazyLock<Regex> =
    LazyLock::new(|| structured("✅", "APPLICATION_APPROVED"));

static INVITATION_DECLINED: LazyLock<Regex> = LazyLock::new(|| structured("🚫", "INVITATION_DECLINED"));

static INVITATION_CANCELLED: LazyLock<Regex> =
    LazyLock::new(|| structured("🚫", "INVITATION_CANCELLED"));

/// `<glyph> <MARKER>: field | field | ...` optionally followed by a quoted
/// personal message on its own paragraph.
fn structured(glyph: &str, marker: &str) -> Regex {
    Regex::new(&format!(
        r#"(?s)^{glyph} {marker}:[ \t]*([^\n]*?)[ \t]*(?:\n\n"(.*)")?$"#
    ))
    .expect("valid regex")
}

/// A structured notification carried inside a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SystemEvent {
    /// A user joined a team.
    TeamJoin {
        /// Who joined.
        user_name: String,
        /// Greeting left by the new member.
        personal_message: Option<String>,
    },
    /// A user left a team.
    TeamLeave {
        /// Who left.
        user_name: String,
    },
    /// Invitee's reply to an invitation (sent when declining with a note).
    InvitationResponse {
        /// Team the invitation was for.
        team_name: String,
        /// The reply.
        message: String,
    },
    /// An invitation was declined.
    InvitationDeclined {
        /// Team the invitation was for.
        team_name: String,
        /// Who declined.
        invitee: String,
        /// Whether a personal note accompanies the decline.
        has_personal_message: bool,
        /// The note, when included in the same message.
        personal_message: Option<String>,
    },
    /// An invitation was withdrawn.
    InvitationCancelled {
        /// Team the invitation was for.
        team_name: String,
        /// Who cancelled it.
        cancelled_by: String,
        /// Who had been invited.
        invitee: String,
    },
    /// Narrative approval notice sent to the applicant.
    ApplicationApproved {
        /// Team applied to.
        team_name: String,
        /// Note from the approver.
        personal_message: Option<String>,
    },
    /// Structured approval notice in a direct conversation.
    #[serde(rename = "application_approved_dm")]
    ApplicationApprovedDm {
        /// Team applied to.
        team_name: String,
        /// Who approved.
        approved_by: String,
        /// Who applied.
        applicant: String,
        /// Whether a personal note accompanies the approval.
        has_personal_message: bool,
        /// The note, when included in the same message.
        personal_message: Option<String>,
    },
    /// Structured decline notice.
    ApplicationDeclined {
        /// Team applied to.
        team_name: String,
        /// Who declined.
        declined_by: String,
        /// Who applied.
        applicant: String,
        /// Whether a personal note accompanies the decline.
        has_personal_message: bool,
        /// The note, when included in the same message.
        personal_message: Option<String>,
    },
    /// Reviewer's note on a declined application.
    ApplicationResponse {
        /// Team applied to.
        team_name: String,
        /// The note.
        message: String,
    },
}

impl SystemEvent {
    /// Stable snake_case tag, matching the serialized `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TeamJoin { .. } => "team_join",
            Self::TeamLeave { .. } => "team_leave",
            Self::InvitationResponse { .. } => "invitation_response",
            Self::InvitationDeclined { .. } => "invitation_declined",
            Self::InvitationCancelled { .. } => "invitation_cancelled",
            Self::ApplicationApproved { .. } => "application_approved",
            Self::ApplicationApprovedDm { .. } => "application_approved_dm",
            Self::ApplicationDeclined { .. } => "application_declined",
            Self::ApplicationResponse { .. } => "application_response",
        }
    }
}

type Matcher = fn(&str) -> Option<SystemEvent>;

/// Priority order. Earlier entries win.
const MATCHERS: [Matcher; 9] = [
    team_join,
    invitation_response,
    application_approved,
    application_response,
    team_leave,
    application_declined,
    application_approved_dm,
    invitation_declined,
    invitation_cancelled,
];

/// Classify message text. `None` means an ordinary message.
pub fn parse(content: &str) -> Option<SystemEvent> {
    let content = content.trim();
    MATCHERS.iter().find_map(|matcher| matcher(content))
}

/// Whether the text encodes any system event.
pub fn is_system_message(content: &str) -> bool {
    parse(content).is_some()
}

fn team_join(content: &str) -> Option<SystemEvent> {
    let caps = TEAM_JOIN.captures(content)?;
    Some(SystemEvent::TeamJoin {
        user_name: non_empty(caps.get(1)?.as_str())?,
        personal_message: caps.get(2).map(|m| m.as_str().to_string()),
    })
}

fn invitation_response(content: &str) -> Option<SystemEvent> {
    let caps = INVITATION_RESPONSE.captures(content)?;
    Some(SystemEvent::InvitationResponse {
        team_name: non_empty(caps.get(1)?.as_str())?,
        message: caps.get(2)?.as_str().to_string(),
    })
}

fn application_approved(content: &str) -> Option<SystemEvent> {
    let caps = APPLICATION_APPROVED.captures(content)?;
    Some(SystemEvent::ApplicationApproved {
        team_name: non_empty(caps.get(1)?.as_str())?,
        personal_message: caps.get(2).map(|m| m.as_str().to_string()),
    })
}

fn application_response(content: &str) -> Option<SystemEvent> {
    let caps = APPLICATION_RESPONSE.captures(content)?;
    Some(SystemEvent::ApplicationResponse {
        team_name: non_empty(caps.get(1)?.as_str())?,
        message: caps.get(2)?.as_str().to_string(),
    })
}

fn team_leave(content: &str) -> Option<SystemEvent> {
    let caps = TEAM_LEAVE.captures(content)?;
    Some(SystemEvent::TeamLeave {
        user_name: non_empty(caps.get(1)?.as_str())?,
    })
}

fn application_declined(content: &str) -> Option<SystemEvent> {
    let (fields, personal_message) = structured_fields(&APPLICATION_DECLINED, content)?;
    match fields.as_slice() {
        [team, declined_by, applicant, flag] => Some(SystemEvent::ApplicationDeclined {
            team_name: team.clone(),
            declined_by: declined_by.clone(),
            applicant: applicant.clone(),
            has_personal_message: parse_flag(flag)?,
            personal_message,
        }),
        _ => None,
    }
}

fn application_approved_dm(content: &str) -> Option<SystemEvent> {
    let (fields, personal_message) = structured_fields(&APPLICATION_APPROVED_DM, content)?;
    let (team, approved_by, applicant, has_personal_message) = match fields.as_slice() {
        [team, approved_by, applicant] => {
            (team, approved_by, applicant, personal_message.is_some())
        }
        [team, approved_by, applicant, flag] => (team, approved_by, applicant, parse_flag(flag)?),
        _ => return None,
    };
    Some(SystemEvent::ApplicationApprovedDm {
        team_name: team.clone(),
        approved_by: approved_by.clone(),
        applicant: applicant.clone(),
        has_personal_message,
        personal_message,
    })
}

fn invitation_declined(content: &str) -> Option<SystemEvent> {
    let (fields, personal_message) = structured_fields(&INVITATION_DECLINED, content)?;
    match fields.as_slice() {
        [team, invitee, flag] => Some(SystemEvent::InvitationDeclined {
            team_name: team.clone(),
            invitee: invitee.clone(),
            has_personal_message: parse_flag(flag)?,
            personal_message,
        }),
        _ => None,
    }
}

fn invitation_cancelled(content: &str) -> Option<SystemEvent> {
    let (fields, _) = structured_fields(&INVITATION_CANCELLED, content)?;
    match fields.as_slice() {
        [team, cancelled_by, invitee] => Some(SystemEvent::InvitationCancelled {
            team_name: team.clone(),
            cancelled_by: cancelled_by.clone(),
            invitee: invitee.clone(),
        }),
        _ => None,
    }
}

/// Split the `|`-delimited field list of a structured template. Every field
/// must be non-empty after trimming.
fn structured_fields(pattern: &Regex, content: &str) -> Option<(Vec<String>, Option<String>)> {
    let caps = pattern.captures(content)?;
    let fields = caps
        .get(1)?
        .as_str()
        .split('|')
        .map(non_empty)
        .collect::<Option<Vec<_>>>()?;
    let personal_message = caps.get(2).map(|m| m.as_str().to_string());
    Some((fields, personal_message))
}

fn non_empty(field: &str) -> Option<String> {
    let trimmed = field.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn parse_flag(field: &str) -> Option<bool> {
    if field.eq_ignore_ascii_case("true") {
        Some(true)
    } else if field.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}
