//! Transaction stage engine.
//!
//! A stage is a declarative request/response contract: the request is a
//! list of argument ids paired with a textual or numeric value, the
//! response a list of descriptors stating which arguments must come
//! back and what values they are expected to carry. [`run_stage`]
//! builds the request, sends it, waits for the reply within a bounded
//! timeout and validates every descriptor, returning the captured
//! response fields.
//!
//! A payment transaction is four stages run in sequence:
//!
//! ```text
//! IDL   announce the price and event, learn the operation number,
//!       the terminal-declared timeout and the event number
//! VRP   verify the price under operation number + 1
//! FIN   finalize; the terminal may close right away (EOF tolerated)
//! IDL   trailing cleanup, always attempted, result ignored
//! ```

use std::time::Duration;

use tracing::{debug, info};

use crate::error::{IoError, StageError, TransactionError, ValidationError};
use crate::msg::{
    describe_id, Message, ARG_EVENT_NAME, ARG_EVENT_NUMBER, ARG_MESSAGE_NAME,
    ARG_OPERATION_NUMBER, ARG_OPERATION_TIMEOUT, ARG_PRICE, ARG_PRODUCT_ID, ARG_PRODUCT_NAME,
    PROTO_VMC,
};
use crate::net::Connection;

/// One request field: an argument id with a textual or numeric value.
/// Numeric values are sent as decimal text.
#[derive(Debug, Clone)]
pub struct ReqField {
    pub id: u16,
    pub text: Option<String>,
    pub num: Option<i64>,
}

impl ReqField {
    pub fn text(id: u16, value: impl Into<String>) -> Self {
        Self {
            id,
            text: Some(value.into()),
            num: None,
        }
    }

    pub fn num(id: u16, value: i64) -> Self {
        Self {
            id,
            text: None,
            num: Some(value),
        }
    }
}

/// One response descriptor: the argument id that must (or, when
/// optional, may) appear in the reply, plus the expected values to
/// assert against. String expectations compare case-insensitively,
/// numeric ones by decimal scan of the returned text.
#[derive(Debug, Clone, Default)]
pub struct RespField {
    pub id: u16,
    pub expect_text: Option<String>,
    pub expect_num: Option<i64>,
    pub optional: bool,
}

impl RespField {
    pub fn new(id: u16) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn expect_text(mut self, value: impl Into<String>) -> Self {
        self.expect_text = Some(value.into());
        self
    }

    pub fn expect_num(mut self, value: i64) -> Self {
        self.expect_num = Some(value);
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// Response fields captured by a completed stage, in response order.
#[derive(Debug, Default)]
pub struct StageValues {
    fields: Vec<(u16, String)>,
}

impl StageValues {
    fn push(&mut self, id: u16, text: &str) {
        self.fields.push((id, text.to_string()));
    }

    /// Text of the first captured field with this id.
    pub fn text(&self, id: u16) -> Option<&str> {
        self.fields
            .iter()
            .find(|(fid, _)| *fid == id)
            .map(|(_, v)| v.as_str())
    }

    /// Leading decimal scan of the captured text, `sscanf` style:
    /// "30s" yields 30, a value with no leading digits yields nothing.
    pub fn num(&self, id: u16) -> Option<i64> {
        self.text(id).and_then(scan_decimal)
    }
}

/// Scans an optionally signed decimal integer at the start of `s`,
/// after leading whitespace. Trailing non-digits are ignored.
fn scan_decimal(s: &str) -> Option<i64> {
    let s = s.trim_start();
    let (sign, digits) = match s.strip_prefix('-') {
        Some(rest) => (-1i64, rest),
        None => (1i64, s.strip_prefix('+').unwrap_or(s)),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    digits[..end].parse::<i64>().ok().map(|v| sign * v)
}

/// Runs one request/response exchange against the established peer.
///
/// Every non-absent request field is appended as a textual argument.
/// The reply must arrive within `timeout`; each response descriptor is
/// then checked in order against the first same-id argument of the
/// reply. Unless `allow_eof` is set, an EOF observed during receipt
/// fails the stage.
pub fn run_stage(
    conn: &mut Connection,
    req: &[ReqField],
    resp: &[RespField],
    timeout: Duration,
    allow_eof: bool,
) -> Result<StageValues, StageError> {
    let mut request = Message::new(PROTO_VMC);
    for field in req {
        let value = if let Some(n) = field.num {
            n.to_string()
        } else if let Some(t) = &field.text {
            t.clone()
        } else {
            continue;
        };
        request.append_str(field.id, &value)?;
    }
    debug!("request:\n{request}");
    conn.send(&request)?;

    let mut reply = Message::new(PROTO_VMC);
    let eof = conn.recv(&mut reply, timeout)?;
    debug!("response:\n{reply}");

    let mut values = StageValues::default();
    for desc in resp {
        let arg = match reply.find(desc.id) {
            Some(arg) => arg,
            None if desc.optional => continue,
            None => {
                return Err(ValidationError::MissingParam {
                    id: desc.id,
                    desc: describe_id(desc.id),
                }
                .into())
            }
        };
        let text = arg.text();
        if let Some(t) = text {
            values.push(desc.id, t);
        }
        if let Some(expected) = &desc.expect_text {
            let matches = text.is_some_and(|t| t.eq_ignore_ascii_case(expected));
            if !matches {
                return Err(ValidationError::TextMismatch {
                    id: desc.id,
                    returned: String::from_utf8_lossy(&arg.value).into_owned(),
                    expected: expected.clone(),
                }
                .into());
            }
        }
        if let Some(expected) = desc.expect_num {
            let returned = text.and_then(scan_decimal);
            if returned != Some(expected) {
                return Err(ValidationError::NumMismatch {
                    id: desc.id,
                    returned: returned.unwrap_or(0),
                    expected,
                }
                .into());
            }
        }
    }

    if eof && !allow_eof {
        return Err(IoError::UnexpectedEof.into());
    }
    Ok(values)
}

/// Inputs of one payment transaction.
///
/// The event number is only sent when an event name is present, and the
/// product id only when a product name is present, both defaulting to 0.
#[derive(Debug, Clone, Default)]
pub struct PaymentOptions {
    pub event_number: Option<i64>,
    pub event_name: Option<String>,
    pub product_id: Option<i64>,
    pub product_name: Option<String>,
    /// Price in minor currency units.
    pub price: i64,
    /// Poll timeout for the first stage; later stages run under the
    /// timeout the terminal declares in its IDL reply.
    pub timeout: Duration,
}

/// Runs the full four-stage payment transaction.
///
/// The trailing IDL cleanup stage is attempted regardless of how the
/// first three stages went; its own result never alters the outcome.
pub fn run_payment(conn: &mut Connection, opts: &PaymentOptions) -> Result<(), TransactionError> {
    let mut stage_timeout = opts.timeout;
    let outcome = payment_stages(conn, opts, &mut stage_timeout);

    info!("IDL stage (cleanup)");
    let req = [ReqField::text(ARG_MESSAGE_NAME, "IDL")];
    let resp = [RespField::new(ARG_MESSAGE_NAME).expect_text("IDL")];
    if let Err(e) = run_stage(conn, &req, &resp, stage_timeout, true) {
        debug!("cleanup IDL stage failed: {e}");
    }

    outcome
}

fn payment_stages(
    conn: &mut Connection,
    opts: &PaymentOptions,
    stage_timeout: &mut Duration,
) -> Result<(), TransactionError> {
    info!("IDL stage");
    let mut req = vec![ReqField::text(ARG_MESSAGE_NAME, "IDL")];
    if let Some(name) = &opts.event_name {
        req.push(ReqField::num(
            ARG_EVENT_NUMBER,
            opts.event_number.unwrap_or(0),
        ));
        req.push(ReqField::text(ARG_EVENT_NAME, name));
    }
    if let Some(name) = &opts.product_name {
        req.push(ReqField::num(ARG_PRODUCT_ID, opts.product_id.unwrap_or(0)));
        req.push(ReqField::text(ARG_PRODUCT_NAME, name));
    }
    req.push(ReqField::num(ARG_PRICE, opts.price));
    let resp = [
        RespField::new(ARG_MESSAGE_NAME).expect_text("IDL"),
        RespField::new(ARG_OPERATION_NUMBER),
        RespField::new(ARG_OPERATION_TIMEOUT),
        RespField::new(ARG_EVENT_NUMBER),
    ];
    let values = run_stage(conn, &req, &resp, *stage_timeout, false)
        .map_err(|source| TransactionError {
            stage: "IDL",
            source,
        })?;

    if let Some(secs) = values.num(ARG_OPERATION_TIMEOUT).filter(|s| *s > 0) {
        *stage_timeout = Duration::from_secs(secs as u64);
    }
    let opnum = values.num(ARG_OPERATION_NUMBER).unwrap_or(0) + 1;

    info!("VRP stage");
    let mut req = vec![
        ReqField::text(ARG_MESSAGE_NAME, "VRP"),
        ReqField::num(ARG_OPERATION_NUMBER, opnum),
    ];
    if let Some(name) = &opts.product_name {
        req.push(ReqField::num(ARG_PRODUCT_ID, opts.product_id.unwrap_or(0)));
        req.push(ReqField::text(ARG_PRODUCT_NAME, name));
    }
    req.push(ReqField::num(ARG_PRICE, opts.price));
    let resp = [
        RespField::new(ARG_MESSAGE_NAME).expect_text("VRP"),
        RespField::new(ARG_OPERATION_NUMBER).expect_num(opnum),
        RespField::new(ARG_PRICE).expect_num(opts.price),
    ];
    run_stage(conn, &req, &resp, *stage_timeout, false).map_err(|source| TransactionError {
        stage: "VRP",
        source,
    })?;

    info!("FIN stage");
    let mut req = vec![
        ReqField::text(ARG_MESSAGE_NAME, "FIN"),
        ReqField::num(ARG_OPERATION_NUMBER, opnum),
    ];
    if opts.product_name.is_some() {
        req.push(ReqField::num(ARG_PRODUCT_ID, opts.product_id.unwrap_or(0)));
    }
    req.push(ReqField::num(ARG_PRICE, opts.price));
    let resp = [
        RespField::new(ARG_MESSAGE_NAME).expect_text("FIN"),
        RespField::new(ARG_OPERATION_NUMBER).expect_num(opnum),
        RespField::new(ARG_PRICE).expect_num(opts.price),
    ];
    // the terminal may close right after finalizing
    run_stage(conn, &req, &resp, *stage_timeout, true).map_err(|source| TransactionError {
        stage: "FIN",
        source,
    })?;

    Ok(())
}

/// Sends a single IDL exchange and reports its result directly.
pub fn run_ping(conn: &mut Connection, timeout: Duration) -> Result<(), StageError> {
    let req = [ReqField::text(ARG_MESSAGE_NAME, "IDL")];
    let resp = [RespField::new(ARG_MESSAGE_NAME).expect_text("IDL")];
    run_stage(conn, &req, &resp, timeout, false).map(|_| ())
}

// --- tests ------------------------------------------------------------------
