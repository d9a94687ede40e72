// Complexity classifier: pure, local, no network. Scores on message
// count, total message length, tools presence, and keyword cues in the
// LAST USER MESSAGE ONLY - the system prompt is never inspected.
//
// Grounded on other_examples/.../claw-router/src/router.rs's
// `is_sufficient()` style (a small pure heuristic function, unit-tested
// directly against constructed inputs rather than over HTTP).

use crate::envelope::Envelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

const COMPLEXITY_KEYWORDS: &[&str] = &["analyze", "compare", "evaluate"];

/// Pure function: same envelope always classifies the same way.
pub fn classify(envelope: &Envelope) -> Complexity {
    let mut score = 0u32;

    let message_count = envelope.messages.len();
    if message_count > 10 {
        score += 1;
    }
    if message_count > 20 {
        score += 1;
    }

    let total_length = envelope.approx_total_length();
    if total_length > 2000 {
        score += 1;
    }
    if total_length > 6000 {
        score += 1;
    }

    if envelope.has_tools() {
        score += 1;
    }

    let last_message = envelope.last_user_message_text().to_ascii_lowercase();
    if COMPLEXITY_KEYWORDS.iter().any(|kw| last_message.contains(kw)) {
        score += 1;
    }

    if score >= 4 {
        Complexity::Complex
    } else if score >= 2 {
        Complexity::Moderate
    } else {
        Complexity::Simple
    }
}
