// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The session manager: an explicit owner of all live sessions.
//!
//! There is no module-global session list; callers create a manager and
//! open sessions through it, so session lifetime is visible in the type
//! system and tests can run isolated managers side by side.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::config::SessionConfig;
use crate::error::Result;
use crate::session::Session;

/// Owner and registry of live PD sessions.
#[derive(Default)]
pub struct SessionManager {
    sessions: DashMap<u64, Arc<Session>>,
    next_id: AtomicU64,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session: bind its interface, wire the statistics telegrams,
    /// register it. Structural failures abort the open.
    pub fn open_session(&self, cfg: SessionConfig) -> Result<Arc<Session>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Session::open(cfg, id)?;
        self.sessions.insert(id, Arc::clone(&session));
        log::info!("[SESSION] opened session {}", id);
        Ok(session)
    }

    /// Unlink the session and flush it. Outstanding `Arc`s stay usable for
    /// reads but the session no longer owns sockets or queues.
    pub fn close_session(&self, session: &Arc<Session>) {
        if self.sessions.remove(&session.id()).is_some() {
            session.close();
            log::info!("[SESSION] closed session {}", session.id());
        }
    }

    /// Close every session this manager still owns.
    pub fn terminate(&self) {
        let ids: Vec<u64> = self.sessions.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, session)) = self.sessions.remove(&id) {
                session.close();
            }
        }
        log::info!("[SESSION] manager terminated");
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
