use crate::core::errors::KiwoomError;
use crate::core::kernel::Callback;
use crate::core::types::Envelope;
use std::sync::Arc;

/// Executed trade subject
pub const TICK: &str = "0B";
/// Ten-level order book subject
pub const ORDER_BOOK: &str = "0D";
pub const ORDER_BOOK_DEPTH: usize = 10;

const TICK_TIME: &str = "20";
const TICK_PRICE: &str = "10";
const TICK_VOLUME: &str = "15";
const BOOK_TIME: &str = "21";
const ASK_PRICE_BASE: u32 = 41;
const BID_PRICE_BASE: u32 = 51;
const ASK_QTY_BASE: u32 = 61;
const BID_QTY_BASE: u32 = 71;

fn field<'a>(envelope: &'a Envelope, code: &str) -> Result<&'a str, KiwoomError> {
    envelope.value(code).ok_or_else(|| {
        KiwoomError::DecodeError(format!(
            "{} message for {} is missing field {}",
            envelope.subject, envelope.item, code
        ))
    })
}

/// Parse a signed integer field; the sign marks direction, an empty field is zero
fn signed(envelope: &Envelope, code: &str) -> Result<i64, KiwoomError> {
    let raw = field(envelope, code)?.trim();
    if raw.is_empty() {
        return Ok(0);
    }
    raw.trim_start_matches('+').parse().map_err(|e| {
        KiwoomError::DecodeError(format!("Field {} is not an integer ({:?}): {}", code, raw, e))
    })
}

fn expect_subject(envelope: &Envelope, subject: &str) -> Result<(), KiwoomError> {
    if envelope.subject == subject {
        Ok(())
    } else {
        Err(KiwoomError::DecodeError(format!(
            "Expected subject {}, got {}",
            subject, envelope.subject
        )))
    }
}

/// One executed trade
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tick {
    pub item: String,
    /// `HHMMSS`
    pub time: String,
    /// Trade price, without the change-direction sign
    pub price: i64,
    /// Positive for buyer-initiated trades, negative for seller-initiated ones
    pub volume: i64,
}

impl TryFrom<&Envelope> for Tick {
    type Error = KiwoomError;

    fn try_from(envelope: &Envelope) -> Result<Self, Self::Error> {
        expect_subject(envelope, TICK)?;
        Ok(Self {
            item: envelope.item.clone(),
            time: field(envelope, TICK_TIME)?.to_string(),
            price: signed(envelope, TICK_PRICE)?.abs(),
            volume: signed(envelope, TICK_VOLUME)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Level {
    pub price: i64,
    pub quantity: i64,
}

/// Order book snapshot, best level first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBook {
    pub item: String,
    /// `HHMMSS`
    pub time: String,
    pub asks: Vec<Level>,
    pub bids: Vec<Level>,
}

impl OrderBook {
    pub fn best_ask(&self) -> Option<&Level> {
        self.asks.first()
    }

    pub fn best_bid(&self) -> Option<&Level> {
        self.bids.first()
    }
}

fn levels(envelope: &Envelope, price_base: u32, qty_base: u32) -> Result<Vec<Level>, KiwoomError> {
    (0..ORDER_BOOK_DEPTH as u32)
        .map(|depth| {
            Ok(Level {
                price: signed(envelope, &(price_base + depth).to_string())?.abs(),
                quantity: signed(envelope, &(qty_base + depth).to_string())?,
            })
        })
        .collect()
}

impl TryFrom<&Envelope> for OrderBook {
    type Error = KiwoomError;

    fn try_from(envelope: &Envelope) -> Result<Self, Self::Error> {
        expect_subject(envelope, ORDER_BOOK)?;
        Ok(Self {
            item: envelope.item.clone(),
            time: field(envelope, BOOK_TIME)?.to_string(),
            asks: levels(envelope, ASK_PRICE_BASE, ASK_QTY_BASE)?,
            bids: levels(envelope, BID_PRICE_BASE, BID_QTY_BASE)?,
        })
    }
}

/// Wrap a typed handler as a registry callback
///
/// Envelopes that do not parse are reported as callback failures.
pub fn typed_callback<T, F>(handler: F) -> Callback
where
    T: for<'a> TryFrom<&'a Envelope, Error = KiwoomError>,
    F: Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(move |envelope: &Envelope| -> anyhow::Result<()> {
        let message = T::try_from(envelope)?;
        handler(message)
    })
}
