//! Narrow predicates for message events
//!
//! A narrow is an ordered list of terms; a message matches when every term
//! holds. Terms arrive either as `{"operator", "operand", "negated"}` objects
//! or as legacy `["operator", "operand"]` pairs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Narrow operators understood by the event system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NarrowOperator {
    #[serde(alias = "channel")]
    Stream,
    #[serde(alias = "subject")]
    Topic,
    Sender,
    Is,
}

/// One term of a narrow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "TermRepr")]
pub struct NarrowTerm {
    pub operator: NarrowOperator,
    pub operand: String,
    #[serde(default)]
    pub negated: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TermRepr {
    Pair(NarrowOperator, String),
    Object {
        operator: NarrowOperator,
        operand: String,
        #[serde(default)]
        negated: bool,
    },
}

impl From<TermRepr> for NarrowTerm {
    fn from(repr: TermRepr) -> Self {
        match repr {
            TermRepr::Pair(operator, operand) => NarrowTerm::new(operator, operand),
            TermRepr::Object {
                operator,
                operand,
                negated,
            } => NarrowTerm {
                operator,
                operand,
                negated,
            },
        }
    }
}

const RESOLVED_TOPIC_PREFIX: &str = "✔ ";

impl NarrowTerm {
    pub fn new(operator: NarrowOperator, operand: impl Into<String>) -> Self {
        Self {
            operator,
            operand: operand.into(),
            negated: false,
        }
    }

    pub fn negate(mut self) -> Self {
        self.negated = !self.negated;
        self
    }

    /// Evaluate the term against a message payload and the recipient's flags
    pub fn matches(&self, message: &Value, flags: &[String]) -> bool {
        self.holds(message, flags) != self.negated
    }

    fn holds(&self, message: &Value, flags: &[String]) -> bool {
        let is_stream = str_field(message, "type") == Some("stream");
        let has_flag = |flag: &str| flags.iter().any(|f| f == flag);

        match self.operator {
            NarrowOperator::Stream => {
                is_stream
                    && str_field(message, "display_recipient")
                        .map_or(false, |name| same_text(name, &self.operand))
            }
            NarrowOperator::Topic => {
                is_stream && topic(message).map_or(false, |t| same_text(t, &self.operand))
            }
            NarrowOperator::Sender => str_field(message, "sender_email")
                .map_or(false, |email| same_text(email, &self.operand)),
            NarrowOperator::Is => match self.operand.as_str() {
                "dm" | "private" => str_field(message, "type") == Some("private"),
                "starred" => has_flag("starred"),
                "mentioned" | "alerted" => has_flag("mentioned"),
                "unread" => !has_flag("read"),
                "resolved" => {
                    is_stream
                        && topic(message).map_or(false, |t| t.starts_with(RESOLVED_TOPIC_PREFIX))
                }
                _ => true,
            },
        }
    }
}

/// True iff every term matches
pub fn narrow_matches(narrow: &[NarrowTerm], message: &Value, flags: &[String]) -> bool {
    narrow.iter().all(|term| term.matches(message, flags))
}

fn str_field<'a>(message: &'a Value, key: &str) -> Option<&'a str> {
    message.get(key).and_then(Value::as_str)
}

fn topic(message: &Value) -> Option<&str> {
    str_field(message, "topic").or_else(|| str_field(message, "subject"))
}

fn same_text(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stream_message(stream: &str, topic: &str) -> Value {
        json!({
            "id": 1,
            "type": "stream",
            "display_recipient": stream,
            "subject": topic,
            "sender_email": "hamlet@example.com",
        })
    }

    fn flags(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_stream_and_topic_are_case_insensitive() {
        let message = stream_message("Denmark", "Copenhagen");
        let narrow = vec![
            NarrowTerm::new(NarrowOperator::Stream, "denmark"),
            NarrowTerm::new(NarrowOperator::Topic, "COPENHAGEN"),
        ];
        assert!(narrow_matches(&narrow, &message, &[]));

        let other = vec![NarrowTerm::new(NarrowOperator::Stream, "Verona")];
        assert!(!narrow_matches(&other, &message, &[]));
    }

    #[test]
    fn test_stream_term_rejects_direct_messages() {
        let message = json!({"type": "private", "display_recipient": [{"id": 4}]});
        let narrow = vec![NarrowTerm::new(NarrowOperator::Stream, "Denmark")];
        assert!(!narrow_matches(&narrow, &message, &[]));

        let dm = vec![NarrowTerm::new(NarrowOperator::Is, "dm")];
        assert!(narrow_matches(&dm, &message, &[]));
    }

    #[test]
    fn test_flag_operands() {
        let message = stream_message("Denmark", "topic");
        let starred = vec![NarrowTerm::new(NarrowOperator::Is, "starred")];
        assert!(narrow_matches(&starred, &message, &flags(&["starred"])));
        assert!(!narrow_matches(&starred, &message, &[]));

        let alerted = vec![NarrowTerm::new(NarrowOperator::Is, "alerted")];
        assert!(narrow_matches(&alerted, &message, &flags(&["mentioned"])));

        let unread = vec![NarrowTerm::new(NarrowOperator::Is, "unread")];
        assert!(narrow_matches(&unread, &message, &[]));
        assert!(!narrow_matches(&unread, &message, &flags(&["read"])));
    }

    #[test]
    fn test_resolved_topics() {
        let resolved = vec![NarrowTerm::new(NarrowOperator::Is, "resolved")];
        assert!(narrow_matches(
            &resolved,
            &stream_message("Denmark", "✔ fixed"),
            &[]
        ));
        assert!(!narrow_matches(
            &resolved,
            &stream_message("Denmark", "open"),
            &[]
        ));
    }

    #[test]
    fn test_negated_terms() {
        let message = stream_message("Denmark", "topic");
        let narrow = vec![NarrowTerm::new(NarrowOperator::Sender, "HAMLET@example.com").negate()];
        assert!(!narrow_matches(&narrow, &message, &[]));

        let narrow = vec![NarrowTerm::new(NarrowOperator::Sender, "othello@example.com").negate()];
        assert!(narrow_matches(&narrow, &message, &[]));
    }

    #[test]
    fn test_empty_narrow_matches_everything() {
        assert!(narrow_matches(&[], &json!({}), &[]));
    }

    #[test]
    fn test_term_wire_forms() {
        let terms: Vec<NarrowTerm> = serde_json::from_value(json!([
            ["stream", "Denmark"],
            {"operator": "channel", "operand": "Verona", "negated": true},
            {"operator": "subject", "operand": "lunch"},
        ]))
        .unwrap();

        assert_eq!(terms[0], NarrowTerm::new(NarrowOperator::Stream, "Denmark"));
        assert_eq!(
            terms[1],
            NarrowTerm::new(NarrowOperator::Stream, "Verona").negate()
        );
        assert_eq!(terms[2].operator, NarrowOperator::Topic);

        let out = serde_json::to_value(&terms[1]).unwrap();
        assert_eq!(
            out,
            json!({"operator": "stream", "operand": "Verona", "negated": true})
        );
    }

    #[test]
    fn test_unknown_operator_is_rejected() {
        let parsed: Result<Vec<NarrowTerm>, _> =
            serde_json::from_value(json!([["search", "lunch"]]));
        assert!(parsed.is_err());
    }
}
