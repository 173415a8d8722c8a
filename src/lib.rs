// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright © 2023 Adrian <adrian.eddy at gmail>

mod allocator;
mod buffer;
mod buffer_pool;
mod decoder;
mod manager;
mod types;
pub use allocator::*;
pub use buffer::*;
pub use buffer_pool::*;
pub use decoder::*;
pub use manager::*;
pub use types::*;
