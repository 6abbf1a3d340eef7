use rust_decimal::Decimal;
use smol_str::SmolStr;
use std::str::FromStr;
use thiserror::Error;
use vortex_data::subscription::{SubKind, Subscription, UnknownSubKind};
use vortex_execution::{
    error::RequestValidationError,
    order::{ClientOrderId, OrderKind, PlaceOrderRequest, StrategyId, TimeInForce},
};
use vortex_instrument::{Side, symbol::{SymbolError, SymbolId}, venue::Venue};

/// Typed command parsed from one line of the external text command surface.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Order(PlaceOrderRequest),
    Cancel { cid: ClientOrderId },
    Query(QueryTarget),
    Subscribe(Subscription),
    Unsubscribe(Subscription),
    Strategy(StrategyCommand),
}

/// Target of a `QUERY` command.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum QueryTarget {
    Order(ClientOrderId),
    Balances,
    Book { venue: Venue, symbol: SymbolId },
}

/// Strategy lifecycle directive.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum StrategyCommand {
    Load { name: SmolStr, id: StrategyId },
    Start(StrategyId),
    Stop(StrategyId),
    Pause(StrategyId),
    Resume(StrategyId),
    Unload(StrategyId),
    List,
    Status(StrategyId),
}

/// Errors produced when parsing a command line. Surfaced as an `error`
/// event without affecting the engine.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ParseError {
    #[error("empty command line")]
    Empty,

    #[error("unknown command verb: {0}")]
    UnknownVerb(String),

    #[error("missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("invalid number: {0}")]
    InvalidNumber(String),

    #[error("unknown query target: {0}")]
    UnknownQueryTarget(String),

    #[error("unknown strategy action: {0}")]
    UnknownStrategyAction(String),

    #[error(transparent)]
    Symbol(#[from] SymbolError),

    #[error(transparent)]
    Request(#[from] RequestValidationError),

    #[error(transparent)]
    SubKind(#[from] UnknownSubKind),
}

/// Parse a single line of text into a typed [`Command`].
///
/// Grammar (space-separated tokens, leading verb):
/// ```text
/// ORDER <coid> <symbol> <side> <type> <qty> [price] [tif]
/// CANCEL <coid>
/// QUERY <what> [params]
/// SUBSCRIBE <venue> <symbol> <event_type>
/// UNSUBSCRIBE <venue> <symbol> <event_type>
/// STRATEGY <LOAD|START|STOP|PAUSE|RESUME|UNLOAD|LIST|STATUS> [args...]
/// ```
pub fn parse_line(line: &str) -> Result<Command, ParseError> {
    let mut tokens = line.split_whitespace();
    let verb = tokens.next().ok_or(ParseError::Empty)?;

    match verb.to_ascii_uppercase().as_str() {
        "ORDER" => parse_order(&mut tokens),
        "CANCEL" => {
            let cid = ClientOrderId::new(next(&mut tokens, "coid")?)?;
            Ok(Command::Cancel { cid })
        }
        "QUERY" => parse_query(&mut tokens),
        "SUBSCRIBE" => Ok(Command::Subscribe(parse_subscription(&mut tokens)?)),
        "UNSUBSCRIBE" => Ok(Command::Unsubscribe(parse_subscription(&mut tokens)?)),
        "STRATEGY" => parse_strategy(&mut tokens),
        other => Err(ParseError::UnknownVerb(other.to_string())),
    }
}

fn next<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
    name: &'static str,
) -> Result<&'a str, ParseError> {
    tokens.next().ok_or(ParseError::MissingArgument(name))
}

fn parse_decimal(token: &str) -> Result<Decimal, ParseError> {
    Decimal::from_str(token).map_err(|_| ParseError::InvalidNumber(token.to_string()))
}

fn parse_order<'a>(tokens: &mut impl Iterator<Item = &'a str>) -> Result<Command, ParseError> {
    let cid = ClientOrderId::new(next(tokens, "coid")?)?;
    let symbol = SymbolId::new(next(tokens, "symbol")?)?;
    let side = Side::from_str(next(tokens, "side")?)?;
    let kind = OrderKind::from_str(next(tokens, "type")?)?;
    let qty = parse_decimal(next(tokens, "qty")?)?;

    // Limit orders carry a price before the optional tif; market orders
    // go straight to the optional tif
    let (price, tif_token) = match kind {
        OrderKind::Limit => {
            let price = parse_decimal(next(tokens, "price")?)?;
            (Some(price), tokens.next())
        }
        OrderKind::Market => (None, tokens.next()),
    };

    let time_in_force = tif_token
        .map(TimeInForce::from_str)
        .transpose()?
        .unwrap_or_default();

    let request = PlaceOrderRequest::new(
        cid,
        symbol,
        Venue::Simulated,
        side,
        kind,
        qty,
        price,
        time_in_force,
        None,
        None,
    );
    request.validate()?;

    Ok(Command::Order(request))
}

fn parse_query<'a>(tokens: &mut impl Iterator<Item = &'a str>) -> Result<Command, ParseError> {
    let what = next(tokens, "what")?;

    let target = match what.to_ascii_lowercase().as_str() {
        "order" => QueryTarget::Order(ClientOrderId::new(next(tokens, "coid")?)?),
        "balances" | "account" => QueryTarget::Balances,
        "book" => QueryTarget::Book {
            venue: Venue::from_str(next(tokens, "venue")?)?,
            symbol: SymbolId::new(next(tokens, "symbol")?)?,
        },
        other => return Err(ParseError::UnknownQueryTarget(other.to_string())),
    };

    Ok(Command::Query(target))
}

fn parse_subscription<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
) -> Result<Subscription, ParseError> {
    let venue = Venue::from_str(next(tokens, "venue")?)?;
    let symbol = SymbolId::new(next(tokens, "symbol")?)?;
    let kind = SubKind::from_str(next(tokens, "event_type")?)?;

    Ok(Subscription::new(venue, symbol, kind))
}

fn parse_strategy<'a>(tokens: &mut impl Iterator<Item = &'a str>) -> Result<Command, ParseError> {
    let action = next(tokens, "action")?;

    let command = match action.to_ascii_uppercase().as_str() {
        "LOAD" => StrategyCommand::Load {
            name: SmolStr::new(next(tokens, "name")?),
            id: StrategyId::new(next(tokens, "strategy_id")?),
        },
        "START" => StrategyCommand::Start(StrategyId::new(next(tokens, "strategy_id")?)),
        "STOP" => StrategyCommand::Stop(StrategyId::new(next(tokens, "strategy_id")?)),
        "PAUSE" => StrategyCommand::Pause(StrategyId::new(next(tokens, "strategy_id")?)),
        "RESUME" => StrategyCommand::Resume(StrategyId::new(next(tokens, "strategy_id")?)),
        "UNLOAD" => StrategyCommand::Unload(StrategyId::new(next(tokens, "strategy_id")?)),
        "LIST" => StrategyCommand::List,
        "STATUS" => StrategyCommand::Status(StrategyId::new(next(tokens, "strategy_id")?)),
        other => return Err(ParseError::UnknownStrategyAction(other.to_string())),
    };

    Ok(Command::Strategy(command))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_limit_order_with_tif() {
        let Command::Order(request) =
            parse_line("ORDER c1 BTCUSDT Buy Limit 0.5 49000 GTC").unwrap()
        else {
            panic!("expected order command");
        };

        assert_eq!(request.cid, ClientOrderId::new("c1").unwrap());
        assert_eq!(request.symbol, SymbolId::new("BTCUSDT").unwrap());
        assert_eq!(request.side, Side::Buy);
        assert_eq!(request.kind, OrderKind::Limit);
        assert_eq!(request.qty, dec!(0.5));
        assert_eq!(request.price, Some(dec!(49_000)));
        assert_eq!(request.time_in_force, TimeInForce::Gtc);
    }

    #[test]
    fn test_parse_market_order_defaults_tif() {
        let Command::Order(request) = parse_line("ORDER c2 ETHUSDT sell market 2").unwrap()
        else {
            panic!("expected order command");
        };

        assert_eq!(request.kind, OrderKind::Market);
        assert_eq!(request.price, None);
        assert_eq!(request.time_in_force, TimeInForce::Gtc);
    }

    #[test]
    fn test_parse_errors_are_typed() {
        assert_eq!(parse_line(""), Err(ParseError::Empty));
        assert!(matches!(
            parse_line("NONSENSE foo"),
            Err(ParseError::UnknownVerb(_))
        ));
        assert_eq!(
            parse_line("ORDER c1 BTCUSDT Buy Limit"),
            Err(ParseError::MissingArgument("qty"))
        );
        assert!(matches!(
            parse_line("ORDER c1 BTCUSDT Buy Limit abc 1"),
            Err(ParseError::InvalidNumber(_))
        ));
        // Market order with a price fails request validation
        assert!(matches!(
            parse_line("ORDER c1 BTCUSDT Buy Market 1 50000"),
            Err(ParseError::Request(_)) | Err(ParseError::MissingArgument(_))
        ));
    }

    #[test]
    fn test_parse_subscribe_and_strategy() {
        assert_eq!(
            parse_line("SUBSCRIBE simulated BTCUSDT book").unwrap(),
            Command::Subscribe(Subscription::new(
                Venue::Simulated,
                SymbolId::new("BTCUSDT").unwrap(),
                SubKind::OrderBooks,
            ))
        );

        assert_eq!(
            parse_line("STRATEGY LOAD threshold s1").unwrap(),
            Command::Strategy(StrategyCommand::Load {
                name: SmolStr::new("threshold"),
                id: StrategyId::new("s1"),
            })
        );
        assert_eq!(
            parse_line("STRATEGY LIST").unwrap(),
            Command::Strategy(StrategyCommand::List)
        );
    }
}
