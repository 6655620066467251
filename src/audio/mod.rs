//! # Audio Transcoding Module
//!
//! This module holds the signal-level building blocks of the bridge. Nothing in
//! here knows about WebSockets or rooms; every function works on plain sample
//! slices so it can be tested in isolation.
//!
//! ## Key Components:
//! - **Codec**: G.711 μ-law companding (8-bit wire samples ⇄ 16-bit linear PCM)
//! - **Resample**: Streaming sample-rate conversion with carried filter history
//! - **Frame**: PCM frame and wire format descriptors
//! - **Buffer**: Pool of reusable sample buffers shared by all calls
//!
//! ## Audio Formats:
//! - **Wire side**: μ-law, 8kHz, mono, 20ms chunks (160 bytes)
//! - **Room side**: 16-bit linear PCM, typically 48kHz, mono or stereo

pub mod buffer;     // Reusable sample buffers
pub mod codec;      // μ-law compand / decompand
pub mod frame;      // PCM frames and wire format descriptors
pub mod resample;   // Stateful sample-rate conversion
