// SPDX-License-Identifier: Apache-2.0

//! Line-framed message protocol: wire parsing/serialization, per-command
//! schema validation, and a dispatch table to route messages to callbacks.

pub mod dispatcher;
pub mod schema;
pub mod wire;

pub use dispatcher::{always, callback, exact, Dispatcher, MatchFn, MatchOutcome};
pub use schema::{MessageDefinition, ParamDef, ParamFlag, ParamType, SchemaLoader};
pub use wire::{parse, Message};
