// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error types

use std::fmt;

/// Pack engine error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Malformed on-disk structure: bad magic, unsupported version,
    /// struct-size or endian mismatch, inconsistent block sizes
    Format(String),

    /// Offset or size exceeds validated file bounds, string offset past the
    /// string data, missing NUL terminator, bulk index out of range
    Bounds(String),

    /// Chunk header disagrees with the index entry that references it
    Identity(String),

    /// A hash check failed
    Integrity(String),

    /// A count or block size exceeds the hard sanity caps
    SanityLimit(String),

    /// Compression or decompression failure, including size mismatches
    Codec(String),

    /// Underlying I/O failure
    Io(String),

    /// Build pipeline failure (import or cook)
    Pipeline(String),

    /// Runtime loading failure: missing factory, cooked-type mismatch,
    /// missing deserializer
    Runtime(String),

    /// A lookup found nothing
    NotFound(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Format(msg) => write!(f, "format error: {msg}"),
            Error::Bounds(msg) => write!(f, "bounds error: {msg}"),
            Error::Identity(msg) => write!(f, "identity error: {msg}"),
            Error::Integrity(msg) => write!(f, "integrity error: {msg}"),
            Error::SanityLimit(msg) => write!(f, "sanity limit exceeded: {msg}"),
            Error::Codec(msg) => write!(f, "codec error: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::Pipeline(msg) => write!(f, "pipeline error: {msg}"),
            Error::Runtime(msg) => write!(f, "runtime error: {msg}"),
            Error::NotFound(msg) => write!(f, "not found: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
