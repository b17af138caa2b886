use tether_amqp::{Arguments, Value};

/// Matches a routing key against a topic binding pattern, in which `*`
/// stands for exactly one word and `#` for zero or more words.
pub(crate) fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let words: Vec<&str> = routing_key.split('.').collect();

    words_match(&pattern, &words)
}

fn words_match(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => (0..=words.len()).any(|skip| words_match(rest, &words[skip..])),
        Some((&expected, rest)) => match words.split_first() {
            Some((&word, tail)) => (expected == "*" || expected == word) && words_match(rest, tail),
            None => false,
        },
    }
}

/// Matches message headers against the arguments of a headers binding.
///
/// `x-match` selects between requiring all (the default) or any of the
/// binding criteria. Other `x-` arguments are not criteria.
pub(crate) fn headers_match(binding: &Arguments, headers: &Arguments) -> bool {
    let any = matches!(
        binding.get("x-match").and_then(Value::as_str),
        Some("any" | "any-with-x"),
    );

    let mut criteria = binding
        .iter()
        .filter(|(key, _)| !key.starts_with("x-"))
        .peekable();

    if criteria.peek().is_none() {
        return !any;
    }

    let mut matched = criteria.map(|(key, value)| headers.get(key) == Some(value));

    if any {
        matched.any(|matched| matched)
    } else {
        matched.all(|matched| matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_words() {
        assert!(topic_matches("user.created", "user.created"));
        assert!(topic_matches("user.*", "user.created"));
        assert!(!topic_matches("user.*", "user.created.eu"));
        assert!(!topic_matches("user.*", "user"));
    }

    #[test]
    fn topic_hash() {
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("#", ""));
        assert!(topic_matches("user.#", "user"));
        assert!(topic_matches("user.#", "user.created.eu"));
        assert!(topic_matches("#.eu", "user.created.eu"));
        assert!(topic_matches("user.#.eu", "user.eu"));
        assert!(!topic_matches("user.#.eu", "user.created.us"));
    }

    #[test]
    fn headers_all() {
        // Given
        let binding = Arguments::new().with("region", "eu").with("tier", 1);

        // Then
        assert!(headers_match(
            &binding,
            &Arguments::new()
                .with("region", "eu")
                .with("tier", 1)
                .with("extra", true),
        ));
        assert!(!headers_match(&binding, &Arguments::new().with("region", "eu")));
    }

    #[test]
    fn headers_any() {
        // Given
        let binding = Arguments::new()
            .with("x-match", "any")
            .with("region", "eu")
            .with("tier", 1);

        // Then
        assert!(headers_match(&binding, &Arguments::new().with("tier", 1)));
        assert!(!headers_match(&binding, &Arguments::new().with("tier", 2)));
    }

    #[test]
    fn headers_without_criteria() {
        assert!(headers_match(&Arguments::new(), &Arguments::new()));
        assert!(!headers_match(
            &Arguments::new().with("x-match", "any"),
            &Arguments::new(),
        ));
    }
}
