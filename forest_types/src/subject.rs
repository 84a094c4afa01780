//! Subject grammar: dot-separated tokens with `*` and `>` wildcards.

use crate::ValidationError;

/// Prefix reserved for raw ingress subjects.
pub const RIVER_PREFIX: &str = "river.";

/// Prefix reserved for state-change subjects.
pub const HUMUS_PREFIX: &str = "humus.";

/// Subject carrying the runtime heartbeat that ceremony sources count.
pub const DANCE_BEAT_SUBJECT: &str = "dance.beat";

/// Checks that `subject` is a publishable literal: non-empty dot-separated
/// tokens, no wildcards.
pub fn validate_subject(subject: &str) -> Result<(), ValidationError> {
    if subject.is_empty() {
        return Err(ValidationError::EmptySubject);
    }
    for token in subject.split('.') {
        if token.is_empty() {
            return Err(ValidationError::EmptySubjectToken {
                subject: subject.to_string(),
            });
        }
        if token == "*" || token == ">" {
            return Err(ValidationError::WildcardInPublish {
                subject: subject.to_string(),
            });
        }
    }
    Ok(())
}

/// Checks that `pattern` is a valid subscription pattern: non-empty
/// dot-separated tokens, `>` only in trailing position.
pub fn validate_pattern(pattern: &str) -> Result<(), ValidationError> {
    if pattern.is_empty() {
        return Err(ValidationError::EmptySubject);
    }
    let tokens: Vec<_> = pattern.split('.').collect();
    for (i, token) in tokens.iter().enumerate() {
        if token.is_empty() {
            return Err(ValidationError::EmptySubjectToken {
                subject: pattern.to_string(),
            });
        }
        if *token == ">" && i + 1 != tokens.len() {
            return Err(ValidationError::MisplacedTrailingWildcard {
                pattern: pattern.to_string(),
            });
        }
    }
    Ok(())
}

/// Returns true if `subject` matches `pattern`.
///
/// `*` matches exactly one token, `>` matches one or more trailing tokens.
/// A literal token matches itself. Matching is over `.`-separated tokens.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.').peekable();
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some(">"), None) => return false,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (Some(_), _) => return false,
            (None, Some(_)) => return false,
            (None, None) => return true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn literal_subjects() {
        assert!(validate_subject("payment.completed").is_ok());
        assert!(validate_subject("a").is_ok());
        assert_matches!(validate_subject(""), Err(ValidationError::EmptySubject));
        assert_matches!(
            validate_subject("a..b"),
            Err(ValidationError::EmptySubjectToken { .. })
        );
        assert_matches!(
            validate_subject("a.*"),
            Err(ValidationError::WildcardInPublish { .. })
        );
        assert_matches!(
            validate_subject("a.>"),
            Err(ValidationError::WildcardInPublish { .. })
        );
    }

    #[test]
    fn patterns() {
        assert!(validate_pattern("a.*.c").is_ok());
        assert!(validate_pattern("a.>").is_ok());
        assert!(validate_pattern(">").is_ok());
        assert_matches!(
            validate_pattern("a.>.c"),
            Err(ValidationError::MisplacedTrailingWildcard { .. })
        );
        assert_matches!(validate_pattern(""), Err(ValidationError::EmptySubject));
    }

    #[test]
    fn exact_match() {
        assert!(subject_matches("payment.completed", "payment.completed"));
        assert!(!subject_matches("payment.completed", "payment.failed"));
        assert!(!subject_matches("payment", "payment.completed"));
        assert!(!subject_matches("payment.completed", "payment"));
    }

    #[test]
    fn single_token_wildcard() {
        assert!(subject_matches("payment.*", "payment.completed"));
        assert!(subject_matches("*.completed", "payment.completed"));
        assert!(!subject_matches("payment.*", "payment.completed.eu"));
        assert!(!subject_matches("payment.*", "payment"));
    }

    #[test]
    fn trailing_wildcard() {
        assert!(subject_matches("test.multi.>", "test.multi.a"));
        assert!(subject_matches("test.multi.>", "test.multi.a.b"));
        assert!(subject_matches("test.multi.>", "test.multi.a.b.c"));
        // `>` needs at least one token to consume
        assert!(!subject_matches("test.multi.>", "test.multi"));
        assert!(subject_matches(">", "anything.at.all"));
    }

    #[test]
    fn mixed_wildcards() {
        assert!(subject_matches("river.*.github.>", "river.src.github.push.main"));
        assert!(!subject_matches("river.*.github.>", "river.src.gitlab.push"));
    }
}
