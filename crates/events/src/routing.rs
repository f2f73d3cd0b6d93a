//! Routing-key derivation for topic exchanges.
//!
//! Consumer bindings are written against these keys, so the derivation must stay
//! byte-for-byte stable: a `.` goes in at every lowercase→uppercase boundary and
//! the result is lower-cased.

/// Derive the topic routing key for a PascalCase event type.
///
/// ```
/// use eventrelay_events::routing_key;
///
/// assert_eq!(routing_key("OrderCreated"), "order.created");
/// assert_eq!(routing_key("SKU"), "sku");
/// ```
pub fn routing_key(event_type: &str) -> String {
    let mut key = String::with_capacity(event_type.len() + 4);
    let mut prev: Option<char> = None;

    for c in event_type.chars() {
        if let Some(p) = prev {
            if p.is_ascii_lowercase() && c.is_ascii_uppercase() {
                key.push('.');
            }
        }
        key.push(c);
        prev = Some(c);
    }

    key.to_lowercase()
}

/// Does a topic binding pattern match a routing key?
///
/// `*` matches exactly one word, `#` matches zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let words: Vec<&str> = routing_key.split('.').collect();
    matches_words(&pattern, &words)
}

fn matches_words(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => (0..=words.len()).any(|skip| matches_words(rest, &words[skip..])),
        Some((&head, rest)) => match words.split_first() {
            Some((&word, remaining)) if head == "*" || head == word => matches_words(rest, remaining),
            _ => false,
        },
    }
}
