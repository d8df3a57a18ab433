// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Entity model: publications, subscriptions, handles, sequence tracking.

pub mod arena;
pub mod publication;
pub mod sequence;
pub mod subscription;

pub use arena::{Arena, Handle};
pub use publication::{PubAddress, Publication};
pub use sequence::{SeqCheck, SequenceTracker};
pub use subscription::{RxKey, SubAddress, Subscription, TimeoutBehavior};

/// Kind tag for publication handles.
pub enum PubKind {}
/// Kind tag for subscription handles.
pub enum SubKind {}

/// Handle to a publication, returned by `publish`/`request`.
pub type PubHandle = Handle<PubKind>;
/// Handle to a subscription, returned by `subscribe`.
pub type SubHandle = Handle<SubKind>;

/// Caller-visible behavior flags shared by publications and subscriptions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PdFlags {
    /// Deliver data through the registered callback.
    pub callback: bool,
    /// Invoke the callback on every reception, changed payload or not.
    pub force_cb: bool,
    /// Run the session marshaller over payloads in put/get.
    pub marshall: bool,
    /// Use the v2 (TSN) frame format.
    pub tsn: bool,
}
