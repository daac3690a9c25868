//! Client-side implementation of the Vendotek POS/VMC payment terminal
//! protocol over TCP.
//!
//! The crate is split along the protocol's own seams:
//! - [`msg`] — the message data model: protocol ids, TLV arguments,
//!   append/reset mutation with an eagerly maintained declared length;
//! - [`codec`] — the pure wire codec (custom varints, 4-byte header);
//! - [`stream`] — the byte buffer shared by codec and socket I/O;
//! - [`net`] — the connection state machine over active and passive
//!   TCP roles, with single-write send and poll-then-drain receive;
//! - [`stage`] — the transaction engine that sequences IDL/VRP/FIN
//!   exchanges with strict response validation;
//! - [`error`] — the error taxonomy everything above reports with.

pub mod codec;
pub mod error;
pub mod msg;
pub mod net;
pub mod stage;
pub mod stream;

pub use error::{
    CodecError, ConnectionError, IoError, StageError, TransactionError, ValidationError,
};
pub use msg::{Argument, Message, PROTO_POS, PROTO_VMC};
pub use net::{Connection, NetState};
pub use stage::{run_payment, run_ping, run_stage, PaymentOptions, ReqField, RespField};
pub use stream::ByteStream;
