// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod compressor;
pub mod serializer;
pub mod signature;

pub use compressor::{CompressError, CompressionStats, StateCompressor};
pub use serializer::{CodecError, PayloadSizes, SwarmSerializer};
pub use signature::{BroadcastSigner, SignatureError};
