//! Bounded pool of authenticated sessions.
//!
//! Sessions are created lazily up to `max_size`. A caller that finds the pool empty and at its
//! bound blocks until a session is released (or the acquire timeout passes). Every session
//! handed out goes back exactly once: [`PooledSession`] returns it on drop and
//! [`PooledSession::destroy`] discards it instead.

use crate::{
    backend::SessionHandle,
    error::{SsmError, SsmResult},
    session::Session,
    token::TokenContext,
};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::{
    collections::VecDeque,
    ops::Deref,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

#[derive(Debug)]
struct PoolState {
    idle: VecDeque<SessionHandle>,
    /// Sessions handed out or idle, plus opens still in flight.
    live: usize,
    /// Opens running outside the lock; they stay counted across a reset until they settle.
    opening: usize,
    /// `destroy_all` calls in progress. Checkouts wait while this is non-zero.
    resetting: usize,
    closed: bool,
    /// Bumped by `destroy_all`; sessions from an older generation are not returned to the pool.
    generation: u64,
}

/// Snapshot of pool occupancy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub max_size: usize,
    pub live: usize,
    pub available: usize,
    pub in_use: usize,
}

#[derive(Debug)]
pub struct SessionPool {
    token: Arc<TokenContext>,
    max_size: usize,
    acquire_timeout: Option<Duration>,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl SessionPool {
    pub fn new(token: Arc<TokenContext>, max_size: usize) -> SsmResult<Self> {
        if max_size == 0 {
            return Err(SsmError::config("session pool needs at least one session"));
        }
        Ok(Self {
            token,
            max_size,
            acquire_timeout: None,
            state: Mutex::new(PoolState {
                idle: VecDeque::with_capacity(max_size),
                live: 0,
                opening: 0,
                resetting: 0,
                closed: false,
                generation: 0,
            }),
            available: Condvar::new(),
        })
    }

    /// Bound how long [`SessionPool::acquire`] waits. Without it, acquire waits indefinitely.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    pub fn token(&self) -> &Arc<TokenContext> {
        &self.token
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Take an idle session, open a new one if under the bound, or wait for a release.
    pub fn acquire(&self) -> SsmResult<PooledSession<'_>> {
        match self.acquire_timeout {
            Some(timeout) => self.acquire_timeout(timeout),
            None => self.checkout(None),
        }
    }

    pub fn acquire_timeout(&self, timeout: Duration) -> SsmResult<PooledSession<'_>> {
        self.checkout(Some((Instant::now() + timeout, timeout)))
    }

    fn checkout(&self, deadline: Option<(Instant, Duration)>) -> SsmResult<PooledSession<'_>> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(SsmError::PoolClosed);
            }
            if state.resetting == 0 {
                if let Some(handle) = state.idle.pop_front() {
                    let generation = state.generation;
                    drop(state);
                    return Ok(self.wrap(handle, generation));
                }
                if state.live < self.max_size {
                    // Reserve the slot, then open outside the lock.
                    state.live += 1;
                    state.opening += 1;
                    let generation = state.generation;
                    drop(state);
                    let opened = self.token.open_authenticated_session();
                    state = self.state.lock();
                    state.opening -= 1;
                    state.live -= 1;
                    match opened {
                        Ok(handle) if state.generation == generation => {
                            state.live += 1;
                            drop(state);
                            debug!(session = handle, "opened pooled session");
                            return Ok(self.wrap(handle, generation));
                        }
                        Ok(handle) => {
                            // The pool was reset while this session was opening.
                            if state.live == 0 {
                                self.token.mark_logged_out();
                            }
                            drop(state);
                            self.close_quietly(handle);
                            self.available.notify_all();
                            state = self.state.lock();
                            continue;
                        }
                        Err(err) => {
                            drop(state);
                            self.available.notify_one();
                            return Err(err);
                        }
                    }
                }
            }
            match deadline {
                None => self.available.wait(&mut state),
                Some((deadline, timeout)) => {
                    let timed_out = self.available.wait_until(&mut state, deadline).timed_out();
                    let starved = state.resetting > 0
                        || (state.idle.is_empty() && state.live >= self.max_size);
                    if timed_out && starved {
                        return Err(SsmError::PoolExhausted(timeout));
                    }
                }
            }
        }
    }

    fn wrap(&self, handle: SessionHandle, generation: u64) -> PooledSession<'_> {
        self.token.touch();
        PooledSession {
            pool: self,
            session: Some(Session::new(handle, self.token.clone())),
            generation,
        }
    }

    fn release(&self, session: Session, generation: u64) {
        let mut state = self.state.lock();
        if state.closed || state.generation != generation {
            drop(state);
            self.close_quietly(session.handle());
            return;
        }
        state.idle.push_back(session.handle());
        drop(state);
        self.available.notify_one();
    }

    fn discard(&self, session: Session, generation: u64) {
        self.close_quietly(session.handle());
        let mut state = self.state.lock();
        if state.generation == generation {
            state.live -= 1;
            if state.live == 0 {
                // The token drops the login with its last session.
                self.token.mark_logged_out();
            }
        }
        drop(state);
        self.available.notify_one();
    }

    fn close_quietly(&self, handle: SessionHandle) {
        if let Err(err) = self.token.backend().close_session(handle) {
            warn!(session = handle, error = %err, "failed to close session");
        }
    }

    /// Log out, close every session on the slot and reset the pool.
    ///
    /// Sessions currently checked out become invalid; they are discarded when released.
    pub fn destroy_all(&self) -> SsmResult<()> {
        let idle = {
            let mut state = self.state.lock();
            state.resetting += 1;
            state.generation += 1;
            state.live = state.opening;
            std::mem::take(&mut state.idle)
        };
        let backend = self.token.backend();
        let logout_session = match idle.front() {
            Some(handle) => Some(*handle),
            None if self.token.is_logged_in() => backend.open_session(self.token.slot()).ok(),
            None => None,
        };
        if let Some(handle) = logout_session {
            if let Err(err) = backend.logout(handle) {
                debug!(error = %err, "logout before teardown failed");
            }
        }
        let closed = backend.close_all_sessions(self.token.slot());
        self.token.mark_logged_out();
        self.state.lock().resetting -= 1;
        self.available.notify_all();
        closed.map_err(|err| SsmError::backend("C_CloseAllSessions", err))?;
        info!(slot = self.token.slot(), "session pool reset");
        Ok(())
    }

    /// Tear down every session and finalize the token. Later acquires fail with `PoolClosed`.
    pub fn shutdown(&self) -> SsmResult<()> {
        let reset = self.destroy_all();
        self.state.lock().closed = true;
        self.available.notify_all();
        reset?;
        self.token.finalize()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            max_size: self.max_size,
            live: state.live,
            available: state.idle.len(),
            in_use: state.live - state.idle.len(),
        }
    }
}

/// A session checked out of the pool. Dropping it returns the session.
#[derive(Debug)]
pub struct PooledSession<'p> {
    pool: &'p SessionPool,
    session: Option<Session>,
    generation: u64,
}

impl PooledSession<'_> {
    /// Close the session instead of returning it, e.g. after the token reported it invalid.
    pub fn destroy(mut self) {
        if let Some(session) = self.session.take() {
            self.pool.discard(session, self.generation);
        }
    }
}

impl Deref for PooledSession<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        // Only `destroy` and `drop` take the session, and both consume the guard.
        self.session.as_ref().unwrap_or_else(|| unreachable!("pooled session already released"))
    }
}

impl Drop for PooledSession<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.release(session, self.generation);
        }
    }
}
