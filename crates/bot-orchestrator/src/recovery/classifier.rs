use bot_fleet_core::{ErrorSeverity, ErrorType, RecoveryStrategy};
use serde::Serialize;

/// Outcome of classifying one error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub error_type: ErrorType,
    pub severity: ErrorSeverity,
    pub strategy: RecoveryStrategy,
    pub retryable: bool,
}

struct Rule {
    keywords: &'static [&'static str],
    classification: Classification,
}

const fn rule(
    keywords: &'static [&'static str],
    error_type: ErrorType,
    severity: ErrorSeverity,
    strategy: RecoveryStrategy,
    retryable: bool,
) -> Rule {
    Rule {
        keywords,
        classification: Classification {
            error_type,
            severity,
            strategy,
            retryable,
        },
    }
}

/// Evaluated in order; the first rule with a matching keyword wins.
const RULES: &[Rule] = &[
    rule(
        &["network", "timeout", "timed out", "connection", "econnrefused", "econnreset"],
        ErrorType::NetworkError,
        ErrorSeverity::Medium,
        RecoveryStrategy::ExponentialBackoff,
        true,
    ),
    rule(
        &["rate limit", "ratelimit", "too many requests", "429"],
        ErrorType::RateLimitError,
        ErrorSeverity::Medium,
        RecoveryStrategy::ExponentialBackoff,
        true,
    ),
    rule(
        &["api", "exchange", "order"],
        ErrorType::ExchangeError,
        ErrorSeverity::Medium,
        RecoveryStrategy::Retry,
        true,
    ),
    rule(
        &["auth", "unauthorized", "forbidden", "token", "401", "403"],
        ErrorType::AuthenticationError,
        ErrorSeverity::High,
        RecoveryStrategy::AlertAdmin,
        false,
    ),
    rule(
        &["database", "sql", "pool", "deadlock"],
        ErrorType::DatabaseError,
        ErrorSeverity::High,
        RecoveryStrategy::ExponentialBackoff,
        true,
    ),
    rule(
        &["strategy"],
        ErrorType::StrategyError,
        ErrorSeverity::Medium,
        RecoveryStrategy::Fallback,
        true,
    ),
    rule(
        &["config", "missing", "invalid", "required"],
        ErrorType::ConfigurationError,
        ErrorSeverity::High,
        RecoveryStrategy::AlertAdmin,
        false,
    ),
    rule(
        &["validation", "validate"],
        ErrorType::ValidationError,
        ErrorSeverity::Low,
        RecoveryStrategy::NoAction,
        false,
    ),
    rule(
        &["memory", "cpu", "disk", "system"],
        ErrorType::SystemError,
        ErrorSeverity::Critical,
        RecoveryStrategy::Restart,
        false,
    ),
];

const UNKNOWN: Classification = Classification {
    error_type: ErrorType::UnknownError,
    severity: ErrorSeverity::Medium,
    strategy: RecoveryStrategy::Retry,
    retryable: true,
};

/// Phrases match as substrings; single words match the start of a word, so
/// `order` matches `orders` but `api` does not match `capital`.
fn matches(text: &str, words: &[&str], keyword: &str) -> bool {
    if keyword.contains(' ') {
        text.contains(keyword)
    } else {
        words.iter().any(|w| w.starts_with(keyword))
    }
}

/// Classifies an error by keywords in its message.
#[must_use]
pub fn classify_message(message: &str) -> Classification {
    let text = message.to_lowercase();
    let words: Vec<&str> = text
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    RULES
        .iter()
        .find(|rule| rule.keywords.iter().any(|k| matches(&text, &words, k)))
        .map_or(UNKNOWN, |rule| rule.classification)
}

/// Classifies an error using its full context chain.
#[must_use]
pub fn classify(error: &anyhow::Error) -> Classification {
    classify_message(&format!("{error:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind(message: &str) -> ErrorType {
        classify_message(message).error_type
    }

    #[test]
    fn test_rule_table() {
        assert_eq!(kind("Connection reset by peer"), ErrorType::NetworkError);
        assert_eq!(kind("request timed out after 5s"), ErrorType::NetworkError);
        assert_eq!(kind("HTTP 429 Too Many Requests"), ErrorType::RateLimitError);
        assert_eq!(kind("exchange rejected the order"), ErrorType::ExchangeError);
        assert_eq!(kind("Unauthorized: bad signature"), ErrorType::AuthenticationError);
        assert_eq!(kind("token expired"), ErrorType::AuthenticationError);
        assert_eq!(kind("sqlite busy"), ErrorType::DatabaseError);
        assert_eq!(kind("strategy panicked on NaN"), ErrorType::StrategyError);
        assert_eq!(kind("required field lookback"), ErrorType::ConfigurationError);
        assert_eq!(kind("failed to validate signal"), ErrorType::ValidationError);
        assert_eq!(kind("out of memory"), ErrorType::SystemError);
        assert_eq!(kind("something odd happened"), ErrorType::UnknownError);
    }

    #[test]
    fn test_first_match_wins() {
        // Network outranks database.
        assert_eq!(kind("database connection refused"), ErrorType::NetworkError);
        // Rate limit outranks the generic exchange rule.
        assert_eq!(kind("exchange api rate limit hit"), ErrorType::RateLimitError);
        // Strategy outranks configuration.
        assert_eq!(kind("strategy returned invalid output"), ErrorType::StrategyError);
    }

    #[test]
    fn test_word_prefix_matching() {
        assert_eq!(kind("orders backlog"), ErrorType::ExchangeError);
        assert_eq!(kind("insufficient capital"), ErrorType::UnknownError);
    }

    #[test]
    fn test_recovery_strategies() {
        let auth = classify_message("forbidden");
        assert_eq!(auth.strategy, RecoveryStrategy::AlertAdmin);
        assert!(!auth.retryable);

        let system = classify_message("disk full");
        assert_eq!(system.strategy, RecoveryStrategy::Restart);
        assert_eq!(system.severity, ErrorSeverity::Critical);

        let network = classify_message("network unreachable");
        assert_eq!(network.strategy, RecoveryStrategy::ExponentialBackoff);
        assert!(network.retryable);
    }

    #[test]
    fn test_context_chain_is_considered() {
        let err = anyhow::anyhow!("socket closed").context("strategy execution failed");
        assert_eq!(classify(&err).error_type, ErrorType::StrategyError);
    }
}
