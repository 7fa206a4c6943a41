//! Leader election for one store location.
//!
//! Each instance runs one supervisor task. The supervisor first tries to
//! reach a leader on the endpoint; when none answers it tries to open the
//! store itself. Whoever holds the store lock leads: it listens on the
//! endpoint, routes its own calls straight to the store and drains any
//! calls it queued while the race was undecided.
//!
//! ```text
//! Racing --connect ok--> FollowerConnected --leader gone--> Racing
//!   |
//!   +--connect failed--> open store --locked--> (retry, bounded) Racing
//!                           |
//!                           +--ok--> listen --> self-flush --> LeaderListening
//! ```

mod leader;
mod supervisor;

pub(crate) use supervisor::run;
