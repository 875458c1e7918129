//! Static tables deciding how long responses live and what a mutation invalidates.

use std::time::Duration;

use crate::config::CacheConfig;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;

/// A TTL bound to every endpoint containing `pattern`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlRule {
  pub pattern: String,
  pub ttl: Duration,
}

/// Per-endpoint TTL table. The longest matching pattern wins; unmatched
/// endpoints get `default_ttl`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
  default_ttl: Duration,
  rules: Vec<TtlRule>,
}

impl CachePolicy {
  pub fn new(default_ttl: Duration) -> Self {
    Self {
      default_ttl,
      rules: Vec::new(),
    }
  }

  pub fn with_rule(mut self, pattern: &str, ttl: Duration) -> Self {
    self.rules.push(TtlRule {
      pattern: pattern.to_string(),
      ttl,
    });
    self
  }

  pub fn from_config(config: &CacheConfig) -> Self {
    let default_ttl = Duration::from_secs(config.default_ttl_secs);
    match &config.policies {
      Some(rules) => rules
        .iter()
        .fold(Self::new(default_ttl), |policy, rule| {
          policy.with_rule(&rule.pattern, Duration::from_secs(rule.ttl_secs))
        }),
      None => Self {
        default_ttl,
        ..Self::default()
      },
    }
  }

  pub fn default_ttl(&self) -> Duration {
    self.default_ttl
  }

  /// TTL for `endpoint`.
  pub fn ttl_for(&self, endpoint: &str) -> Duration {
    self
      .rules
      .iter()
      .filter(|rule| endpoint.contains(rule.pattern.as_str()))
      .max_by_key(|rule| rule.pattern.len())
      .map(|rule| rule.ttl)
      .unwrap_or(self.default_ttl)
  }
}

impl Default for CachePolicy {
  /// Catalog data lives longest, financial and notification data shortest.
  fn default() -> Self {
    let secs = Duration::from_secs;
    Self::new(secs(HOUR))
      .with_rule("lottery/games", secs(12 * HOUR))
      .with_rule("lottery/draws/past", secs(24 * HOUR))
      .with_rule("lottery/draws/upcoming", secs(5 * MINUTE))
      .with_rule("stats", secs(6 * HOUR))
      .with_rule("reference", secs(24 * HOUR))
      .with_rule("users/profile", secs(30 * MINUTE))
      .with_rule("users/notifications", secs(5 * MINUTE))
      .with_rule("lottery/tickets", secs(5 * MINUTE))
      .with_rule("payments/transactions", secs(15 * MINUTE))
      .with_rule("payments/wallet", secs(2 * MINUTE))
  }
}

/// Mutated endpoints matching `pattern` invalidate every pattern in `invalidates`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationRule {
  pub pattern: String,
  pub invalidates: Vec<String>,
}

/// Map from mutated endpoint to the cache patterns it makes stale.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationMap {
  rules: Vec<InvalidationRule>,
}

impl InvalidationMap {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_rule(mut self, pattern: &str, invalidates: &[&str]) -> Self {
    self.rules.push(InvalidationRule {
      pattern: pattern.to_string(),
      invalidates: invalidates.iter().map(|p| p.to_string()).collect(),
    });
    self
  }

  pub fn from_config(config: &CacheConfig) -> Self {
    match &config.invalidation {
      Some(rules) => Self {
        rules: rules
          .iter()
          .map(|rule| InvalidationRule {
            pattern: rule.pattern.clone(),
            invalidates: rule.invalidates.clone(),
          })
          .collect(),
      },
      None => Self::builtin(),
    }
  }

  /// Default map for the lottery API this gateway was first written against.
  pub fn builtin() -> Self {
    Self::new()
      .with_rule("users/profile", &["users/profile"])
      .with_rule("users/notifications", &["users/notifications"])
      .with_rule(
        "lottery/tickets",
        &["lottery/tickets", "payments/wallet", "payments/transactions"],
      )
      .with_rule("payments", &["payments/transactions", "payments/wallet"])
      .with_rule("lottery/games", &["lottery/games"])
      .with_rule("lottery/draws", &["lottery/draws"])
  }

  /// Patterns to purge after a successful mutation of `endpoint`.
  ///
  /// Always starts with the endpoint itself, followed by the targets of
  /// every matching rule, without duplicates.
  pub fn patterns_for(&self, endpoint: &str) -> Vec<String> {
    let mut patterns = vec![endpoint.to_string()];
    for rule in self
      .rules
      .iter()
      .filter(|rule| endpoint.contains(rule.pattern.as_str()))
    {
      for target in &rule.invalidates {
        if !patterns.contains(target) {
          patterns.push(target.clone());
        }
      }
    }
    patterns
  }
}
