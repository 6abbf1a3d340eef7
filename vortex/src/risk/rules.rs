use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use vortex_execution::order::{OrderKind, PlaceOrderRequest};
use vortex_instrument::{Side, symbol::SymbolId, venue::Venue};

/// Market and account observations a rule predicate can test, alongside the
/// order itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleContext {
    pub notional: Option<Decimal>,
    pub position_size: Decimal,
    pub mid_price: Option<Decimal>,
}

/// Atomic predicate over order fields, position and market state.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    SymbolIs(SymbolId),
    VenueIs(Venue),
    SideIs(Side),
    KindIs(OrderKind),
    QtyAbove(Decimal),
    NotionalAbove(Decimal),
    PositionSizeAbove(Decimal),
    MidPriceBelow(Decimal),
    MidPriceAbove(Decimal),
}

impl Predicate {
    fn matches(&self, request: &PlaceOrderRequest, ctx: &RuleContext) -> bool {
        match self {
            Predicate::SymbolIs(symbol) => request.symbol == *symbol,
            Predicate::VenueIs(venue) => request.venue == *venue,
            Predicate::SideIs(side) => request.side == *side,
            Predicate::KindIs(kind) => request.kind == *kind,
            Predicate::QtyAbove(limit) => request.qty > *limit,
            Predicate::NotionalAbove(limit) => {
                ctx.notional.is_some_and(|notional| notional > *limit)
            }
            Predicate::PositionSizeAbove(limit) => ctx.position_size.abs() > *limit,
            Predicate::MidPriceBelow(limit) => {
                ctx.mid_price.is_some_and(|mid| mid < *limit)
            }
            Predicate::MidPriceAbove(limit) => {
                ctx.mid_price.is_some_and(|mid| mid > *limit)
            }
        }
    }
}

/// Composite rule expression: AND/OR/NOT over atomic predicates.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleExpr {
    All(Vec<RuleExpr>),
    Any(Vec<RuleExpr>),
    Not(Box<RuleExpr>),
    Atom(Predicate),
}

impl RuleExpr {
    pub fn matches(&self, request: &PlaceOrderRequest, ctx: &RuleContext) -> bool {
        match self {
            RuleExpr::All(exprs) => exprs.iter().all(|expr| expr.matches(request, ctx)),
            RuleExpr::Any(exprs) => exprs.iter().any(|expr| expr.matches(request, ctx)),
            RuleExpr::Not(expr) => !expr.matches(request, ctx),
            RuleExpr::Atom(predicate) => predicate.matches(request, ctx),
        }
    }
}

/// Action taken when a rule matches.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Reject the order with the rule's name as reason.
    Reject,
    /// Explicitly allow the order, short-circuiting lower-priority rules.
    Allow,
}

/// A user-defined rule: a named expression with a priority and action.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct Rule {
    pub name: String,
    /// Lower values evaluate first.
    pub priority: u32,
    pub expr: RuleExpr,
    pub action: RuleAction,
}

/// Ordered set of user-defined rules.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(mut rules: Vec<Rule>) -> Self {
        rules.sort_by_key(|rule| rule.priority);
        Self { rules }
    }

    pub fn add(&mut self, rule: Rule) {
        self.rules.push(rule);
        self.rules.sort_by_key(|rule| rule.priority);
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate rules in priority order; the first matching rule decides.
    ///
    /// Returns the name of the rejecting rule, if any.
    pub fn evaluate(&self, request: &PlaceOrderRequest, ctx: &RuleContext) -> Option<&str> {
        for rule in &self.rules {
            if rule.expr.matches(request, ctx) {
                return match rule.action {
                    RuleAction::Reject => Some(rule.name.as_str()),
                    RuleAction::Allow => None,
                };
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use vortex_execution::order::{ClientOrderId, TimeInForce};

    fn request(side: Side, qty: Decimal) -> PlaceOrderRequest {
        PlaceOrderRequest::new(
            ClientOrderId::new("c1").unwrap(),
            SymbolId::new("BTCUSDT").unwrap(),
            Venue::Simulated,
            side,
            OrderKind::Limit,
            qty,
            Some(dec!(50_000)),
            TimeInForce::Gtc,
            None,
            None,
        )
    }

    #[test]
    fn test_composite_expression_evaluation() {
        let expr = RuleExpr::All(vec![
            RuleExpr::Atom(Predicate::SideIs(Side::Sell)),
            RuleExpr::Not(Box::new(RuleExpr::Atom(Predicate::QtyAbove(dec!(10))))),
        ]);

        let ctx = RuleContext::default();
        assert!(expr.matches(&request(Side::Sell, dec!(5)), &ctx));
        assert!(!expr.matches(&request(Side::Buy, dec!(5)), &ctx));
        assert!(!expr.matches(&request(Side::Sell, dec!(11)), &ctx));
    }

    #[test]
    fn test_first_matching_rule_decides_by_priority() {
        let rules = RuleSet::new(vec![
            Rule {
                name: "block_large_sells".to_string(),
                priority: 10,
                expr: RuleExpr::All(vec![
                    RuleExpr::Atom(Predicate::SideIs(Side::Sell)),
                    RuleExpr::Atom(Predicate::QtyAbove(dec!(1))),
                ]),
                action: RuleAction::Reject,
            },
            Rule {
                name: "allow_btc".to_string(),
                priority: 5,
                expr: RuleExpr::Atom(Predicate::SymbolIs(SymbolId::new("BTCUSDT").unwrap())),
                action: RuleAction::Allow,
            },
        ]);

        // The allow rule has higher priority (lower value) and short-circuits
        let ctx = RuleContext::default();
        assert_eq!(rules.evaluate(&request(Side::Sell, dec!(2)), &ctx), None);
    }

    #[test]
    fn test_reject_rule_returns_rule_name() {
        let rules = RuleSet::new(vec![Rule {
            name: "no_market_orders".to_string(),
            priority: 1,
            expr: RuleExpr::Atom(Predicate::NotionalAbove(dec!(100_000))),
            action: RuleAction::Reject,
        }]);

        let ctx = RuleContext {
            notional: Some(dec!(150_000)),
            ..Default::default()
        };
        assert_eq!(
            rules.evaluate(&request(Side::Buy, dec!(3)), &ctx),
            Some("no_market_orders")
        );
    }
}
