// geowarden/src/protocol/response.rs
//
// Verdict → policy protocol reply.
//
//   Pass                     → action=DUNNO
//   WarnAdded / WarnBlocking → action=WARN <message>
//   Reject                   → action=REJECT <message>

use crate::events::Verdict;

pub const TERMINATOR: &str = "\n\n";

pub fn action_text(verdict: &Verdict) -> String {
    match verdict {
        Verdict::Pass => "DUNNO".to_string(),
        Verdict::WarnAdded { message } | Verdict::WarnBlocking { message } => {
            format!("WARN {}", single_line(message))
        }
        Verdict::Reject { message } => format!("REJECT {}", single_line(message)),
    }
}

/// Full reply for one request, terminator included.
pub fn encode(verdict: &Verdict) -> String {
    format!("action={}{TERMINATOR}", action_text(verdict))
}

// a stray line break inside a message would end the reply early
fn single_line(message: &str) -> String {
    message.replace(['\r', '\n'], " ")
}
