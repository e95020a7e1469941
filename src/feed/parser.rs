//! Classifies raw Kraken feed frames.
//!
//! Ticker updates arrive as positional arrays
//! (`[channelId, {"a": [price, ...], ...}, "ticker", pair]`), control messages as
//! objects with an `"event"` field. The first non-whitespace byte picks the
//! shape, then a single typed serde pass decodes it. Every failure collapses to
//! [`ParsedEvent::Unrecognized`]; nothing here returns an error or panics.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::de::{self, Deserializer, IgnoredAny, SeqAccess, Visitor};
use serde::Deserialize;

/// Outcome of classifying one feed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedEvent {
    Ticker(TickerUpdate),
    Control(ControlEvent),
    Unrecognized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickerUpdate {
    pub pair: String,
    pub ask: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlEvent {
    pub kind: ControlKind,
    /// Acknowledged pair for `subscriptionStatus`, status for `systemStatus`,
    /// message for `error`.
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Heartbeat,
    SystemStatus,
    SubscriptionStatus,
    Pong,
    Error,
}

impl ControlKind {
    fn from_event(event: &str) -> Option<Self> {
        match event {
            "heartbeat" => Some(Self::Heartbeat),
            "systemStatus" => Some(Self::SystemStatus),
            "subscriptionStatus" => Some(Self::SubscriptionStatus),
            "pong" => Some(Self::Pong),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// `[channelId, fields, channelName, pair]`. Serde rejects any other arity.
#[derive(Deserialize)]
struct TickerFrame(IgnoredAny, TickerFields, IgnoredAny, String);

#[derive(Deserialize)]
struct TickerFields {
    #[serde(rename = "a", deserialize_with = "first_price")]
    ask: Decimal,
}

#[derive(Deserialize)]
struct ControlFrame {
    event: String,
    #[serde(default)]
    pair: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default, rename = "errorMessage")]
    error_message: Option<String>,
}

/// Deserialize `[price, wholeLotVolume, lotVolume]`, keeping only the price.
/// Remaining elements are drained without allocation.
fn first_price<'de, D>(deserializer: D) -> std::result::Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    struct FirstPrice;

    impl<'de> Visitor<'de> for FirstPrice {
        type Value = Decimal;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "a non-empty array starting with a price string")
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Decimal, A::Error> {
            let Some(raw) = seq.next_element::<Cow<'de, str>>()? else {
                return Err(de::Error::invalid_length(0, &self));
            };
            let price = Decimal::from_str(&raw).map_err(de::Error::custom)?;
            while seq.next_element::<IgnoredAny>()?.is_some() {}
            Ok(price)
        }
    }

    deserializer.deserialize_seq(FirstPrice)
}

/// Classify a text frame.
#[must_use]
pub fn parse(raw: &str) -> ParsedEvent {
    match raw.trim_start().as_bytes().first() {
        Some(b'[') => parse_ticker(raw),
        Some(b'{') => parse_control(raw),
        _ => ParsedEvent::Unrecognized,
    }
}

/// Classify a binary frame. Non-UTF-8 payloads are unrecognized.
#[must_use]
pub fn parse_bytes(raw: &[u8]) -> ParsedEvent {
    std::str::from_utf8(raw).map_or(ParsedEvent::Unrecognized, parse)
}

fn parse_ticker(raw: &str) -> ParsedEvent {
    match serde_json::from_str::<TickerFrame>(raw) {
        Ok(TickerFrame(_, fields, _, pair)) if fields.ask >= Decimal::ZERO && !pair.is_empty() => {
            ParsedEvent::Ticker(TickerUpdate {
                pair,
                ask: fields.ask,
            })
        }
        _ => ParsedEvent::Unrecognized,
    }
}

fn parse_control(raw: &str) -> ParsedEvent {
    let Ok(frame) = serde_json::from_str::<ControlFrame>(raw) else {
        return ParsedEvent::Unrecognized;
    };
    let Some(kind) = ControlKind::from_event(&frame.event) else {
        return ParsedEvent::Unrecognized;
    };
    let detail = match kind {
        ControlKind::SubscriptionStatus => frame.pair,
        ControlKind::SystemStatus => frame.status,
        ControlKind::Error => frame.error_message,
        ControlKind::Heartbeat | ControlKind::Pong => None,
    };
    ParsedEvent::Control(ControlEvent { kind, detail })
}
