//! # kext-interface
//!
//! User-space protocol engine for a network-filtering kernel driver.
//!
//! The driver intercepts connections and asks user space what to do with
//! them. This crate speaks its binary protocol over the device handle: it
//! reassembles and decodes the driver's info stream and encodes verdicts and
//! control commands back.
//!
//! ## Architecture
//!
//! - **Commands** (user space to driver): `[type][fixed layout]`, one write each
//! - **Infos** (driver to user space): `[type][length u32 LE][payload]`, read in
//!   arbitrary chunks and reassembled into frames
//!
//! ## Example
//!
//! ```ignore
//! use kext_interface::protocol::{Info, Verdict};
//! use kext_interface::{Event, Session};
//!
//! #[tokio::main]
//! async fn main() -> kext_interface::error::Result<()> {
//!     let mut session = Session::builder().start_file(open_device()?)?;
//!
//!     while let Some(event) = session.next_event().await {
//!         match event {
//!             Event::Info(Info::ConnectionV4(conn)) => {
//!                 session.commands().verdict(conn.id, Verdict::Accept)?;
//!             }
//!             Event::Info(Info::LogLine(log)) => println!("{:?}: {}", log.severity(), log.line),
//!             _ => {}
//!         }
//!     }
//!
//!     session.wait().await
//! }
//! ```

pub mod batch;
pub mod error;
pub mod protocol;
pub mod reader;
pub mod session;
pub mod writer;

mod backpressure;

pub use backpressure::{DeliveryPolicy, DroppedCounter};
pub use error::KextError;
pub use session::{Event, Session, SessionBuilder, SessionConfig};
