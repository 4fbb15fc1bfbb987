// Circuit Padding — adaptive cover traffic for anonymity circuits
//
// "Does an observer watching this link learn when two humans are
//  actually talking?"
//
// If the answer is yes, padding exists to take it back. This crate is
// the embedded framework that negotiates per-circuit padding units,
// schedules dummy-cell injections and timed gaps, and orders circuit
// transmission on a shared channel. Circuit construction, cell crypto,
// and the transport live in the embedding node behind small traits;
// padding failures degrade to "no padding", never to a broken circuit.

pub mod cell;
pub mod circuit;
pub mod config;
pub mod context;
pub mod executor;
pub mod inject;
pub mod mux;
pub mod negotiate;
pub mod programs;
pub mod runtime;
pub mod scheduler;
pub mod ticker;

pub use cell::{RelayCell, RelayCommand, CELL_LEN};
pub use circuit::{CellTransport, CircuitId, TransportError};
pub use config::{AlgorithmDescriptor, ConfigRegistry};
pub use context::{run_driver, PaddingContext};
pub use executor::{
    PaddingProgram, ProgramAction, ProgramLoader, ProgramOutcome, StatusSnapshot, UnitStores,
};
pub use inject::{Dequeued, OutboundQueue};
pub use mux::{ChannelLoad, CircuitMuxPolicy, DelayPolicy, EwmaPolicy};
pub use negotiate::{NegotiationCommand, NegotiationRequest, NegotiationResponse, ResponseCode};
pub use programs::BuiltinLoader;
pub use runtime::{CircuitPaddingRuntime, PeerUnitState, UnitCategory};
pub use scheduler::{EventScheduler, TickStats};
