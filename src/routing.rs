// =============================================================================
// Routing Decision Engine — A-book / B-book / C-book per order
// =============================================================================
//
// A pure function of (account group, symbol, volume) over the configured rule
// list. Rules are evaluated in descending priority; the first match wins.
// Patterns are exact strings or `*`-suffixed prefixes (`*` alone matches
// everything). No match defaults to B-book.
// =============================================================================

use serde::Serialize;
use tracing::debug;

use crate::errors::TradeError;
use crate::runtime_config::{RouteAction, RoutingRule};
use crate::types::BookKind;

/// Outcome of rule evaluation for one order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteTarget {
    pub book: BookKind,
    /// Forced LP from the rule (A/C only); the SOR picks one otherwise.
    pub target_lp: Option<String>,
    /// Externally hedged fraction of the notional (C only).
    pub hedge_percent: Option<f64>,
    /// Rule that matched, for audit. `None` means the default applied.
    pub rule_id: Option<String>,
}

impl RouteTarget {
    fn default_b_book() -> Self {
        Self {
            book: BookKind::B,
            target_lp: None,
            hedge_percent: None,
            rule_id: None,
        }
    }
}

/// Glob match: `*` suffix is a prefix wildcard, otherwise exact.
fn pattern_matches(pattern: &str, value: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => pattern == value,
    }
}

/// Evaluate the rule list for one order.
pub fn decide(
    rules: &[RoutingRule],
    account_group: &str,
    symbol: &str,
    volume: f64,
) -> Result<RouteTarget, TradeError> {
    let mut ordered: Vec<&RoutingRule> = rules.iter().collect();
    ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

    for rule in ordered {
        if !pattern_matches(&rule.group_pattern, account_group) {
            continue;
        }
        if !pattern_matches(&rule.symbol_pattern, symbol) {
            continue;
        }
        if volume < rule.volume_min {
            continue;
        }
        if let Some(max) = rule.volume_max {
            if volume > max {
                continue;
            }
        }

        debug!(
            rule = %rule.id,
            group = account_group,
            symbol,
            volume,
            action = ?rule.action,
            "routing rule matched"
        );

        return match rule.action {
            RouteAction::Reject => Err(TradeError::RoutingRejected(format!(
                "rule {} rejects {symbol} for group {account_group}",
                rule.id
            ))),
            RouteAction::A => Ok(RouteTarget {
                book: BookKind::A,
                target_lp: rule.target_lp.clone(),
                hedge_percent: None,
                rule_id: Some(rule.id.clone()),
            }),
            RouteAction::B => Ok(RouteTarget {
                book: BookKind::B,
                target_lp: None,
                hedge_percent: None,
                rule_id: Some(rule.id.clone()),
            }),
            RouteAction::C => Ok(RouteTarget {
                book: BookKind::C,
                target_lp: rule.target_lp.clone(),
                hedge_percent: rule.hedge_percent,
                rule_id: Some(rule.id.clone()),
            }),
        };
    }

    Ok(RouteTarget::default_b_book())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(
        id: &str,
        group: &str,
        symbol: &str,
        action: RouteAction,
        priority: i32,
    ) -> RoutingRule {
        RoutingRule {
            id: id.into(),
            group_pattern: group.into(),
            symbol_pattern: symbol.into(),
            volume_min: 0.0,
            volume_max: None,
            action,
            target_lp: None,
            hedge_percent: None,
            priority,
        }
    }

    #[test]
    fn pattern_semantics() {
        assert!(pattern_matches("*", "anything"));
        assert!(pattern_matches("EUR*", "EURUSD"));
        assert!(!pattern_matches("EUR*", "USDJPY"));
        assert!(pattern_matches("EURUSD", "EURUSD"));
        assert!(!pattern_matches("EURUSD", "EURUSDT"));
    }

    #[test]
    fn no_rules_defaults_to_b_book() {
        let target = decide(&[], "default", "EURUSD", 1.0).unwrap();
        assert_eq!(target.book, BookKind::B);
        assert_eq!(target.rule_id, None);
    }

    #[test]
    fn highest_priority_wins() {
        let rules = vec![
            rule("low", "*", "*", RouteAction::B, 1),
            rule("high", "*", "EUR*", RouteAction::A, 10),
        ];
        let target = decide(&rules, "default", "EURUSD", 1.0).unwrap();
        assert_eq!(target.book, BookKind::A);
        assert_eq!(target.rule_id.as_deref(), Some("high"));
    }

    #[test]
    fn volume_band_is_inclusive_of_min_and_max() {
        let mut banded = rule("band", "*", "*", RouteAction::A, 5);
        banded.volume_min = 1.0;
        banded.volume_max = Some(5.0);
        let rules = vec![banded];

        assert_eq!(decide(&rules, "g", "EURUSD", 0.5).unwrap().book, BookKind::B);
        assert_eq!(decide(&rules, "g", "EURUSD", 1.0).unwrap().book, BookKind::A);
        assert_eq!(decide(&rules, "g", "EURUSD", 5.0).unwrap().book, BookKind::A);
        assert_eq!(decide(&rules, "g", "EURUSD", 5.1).unwrap().book, BookKind::B);
    }

    #[test]
    fn reject_rule_surfaces_routing_rejected() {
        let rules = vec![rule("ban", "scalpers*", "*", RouteAction::Reject, 100)];
        let err = decide(&rules, "scalpers-eu", "EURUSD", 1.0).unwrap_err();
        assert!(matches!(err, TradeError::RoutingRejected(_)));
        // Other groups fall through to the default.
        assert_eq!(
            decide(&rules, "default", "EURUSD", 1.0).unwrap().book,
            BookKind::B
        );
    }

    #[test]
    fn c_book_carries_hedge_percent_and_target() {
        let mut hybrid = rule("hybrid", "*", "XAU*", RouteAction::C, 50);
        hybrid.hedge_percent = Some(0.6);
        hybrid.target_lp = Some("PRIME1".into());
        let target = decide(&[hybrid], "default", "XAUUSD", 2.0).unwrap();
        assert_eq!(target.book, BookKind::C);
        assert_eq!(target.hedge_percent, Some(0.6));
        assert_eq!(target.target_lp.as_deref(), Some("PRIME1"));
    }
}
