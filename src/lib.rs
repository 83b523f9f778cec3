// SPDX-License-Identifier: MIT OR Apache-2.0

mod backend;
mod buffer_pool;
mod frame;
mod queue;
mod session;
mod types;
mod verify;

pub use buffer_pool::*;
pub use frame::*;
pub use session::*;
pub use types::*;
pub use verify::*;
