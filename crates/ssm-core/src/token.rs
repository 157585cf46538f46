use crate::{
    backend::{SessionHandle, SlotId, TokenBackend},
    error::{SsmError, SsmResult},
    mechanism::MechanismType,
    secret::SecretString,
};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

/// The initialized token: backend, slot and user PIN, plus the token-wide login state.
///
/// PKCS#11 login is shared by every session on a token, so the first session logs in and the
/// rest inherit it. The login guard serializes that first login; a token that already considers
/// the user logged in (CKR_USER_ALREADY_LOGGED_IN) counts as success.
pub struct TokenContext {
    backend: Arc<dyn TokenBackend>,
    slot: SlotId,
    pin: SecretString,
    created_at: OffsetDateTime,
    last_used: Mutex<OffsetDateTime>,
    logged_in: Mutex<bool>,
    key_writes: Mutex<()>,
}

impl TokenContext {
    /// Initialize the backend and bind it to `slot`.
    pub fn open(
        backend: Arc<dyn TokenBackend>,
        slot: SlotId,
        pin: SecretString,
    ) -> SsmResult<Arc<Self>> {
        backend
            .initialize()
            .map_err(|err| SsmError::backend("C_Initialize", err))?;
        info!(backend = backend.id(), slot, "token context opened");
        let now = OffsetDateTime::now_utc();
        Ok(Arc::new(Self {
            backend,
            slot,
            pin,
            created_at: now,
            last_used: Mutex::new(now),
            logged_in: Mutex::new(false),
            key_writes: Mutex::new(()),
        }))
    }

    pub fn backend(&self) -> &dyn TokenBackend {
        self.backend.as_ref()
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    pub fn last_used(&self) -> OffsetDateTime {
        *self.last_used.lock()
    }

    pub(crate) fn touch(&self) {
        *self.last_used.lock() = OffsetDateTime::now_utc();
    }

    pub fn is_logged_in(&self) -> bool {
        *self.logged_in.lock()
    }

    /// Forget the login, e.g. after every session on the token was closed.
    pub(crate) fn mark_logged_out(&self) {
        *self.logged_in.lock() = false;
    }

    /// Open a session that can use private objects, logging in if this is the first one.
    pub fn open_authenticated_session(&self) -> SsmResult<SessionHandle> {
        let session = self
            .backend
            .open_session(self.slot)
            .map_err(|err| SsmError::backend("C_OpenSession", err))?;

        let mut logged_in = self.logged_in.lock();
        if *logged_in {
            return Ok(session);
        }
        match self.backend.login(session, &self.pin) {
            Ok(()) => {
                debug!(slot = self.slot, "user logged in");
                *logged_in = true;
                Ok(session)
            }
            Err(err) if err.is_already_logged_in() => {
                *logged_in = true;
                Ok(session)
            }
            Err(err) => {
                drop(logged_in);
                if let Err(close) = self.backend.close_session(session) {
                    warn!(error = %close, "failed to close session after login failure");
                }
                Err(SsmError::backend("C_Login", err))
            }
        }
    }

    pub fn mechanisms(&self) -> SsmResult<Vec<MechanismType>> {
        self.backend
            .mechanisms(self.slot)
            .map_err(|err| SsmError::backend("C_GetMechanismList", err))
    }

    pub fn is_mechanism_supported(&self, mechanism: MechanismType) -> SsmResult<bool> {
        Ok(self.mechanisms()?.contains(&mechanism))
    }

    /// Serialize check-then-create and delete-then-recreate sequences on this token.
    pub(crate) fn reserve_key_writes(&self) -> MutexGuard<'_, ()> {
        self.key_writes.lock()
    }

    pub fn finalize(&self) -> SsmResult<()> {
        self.mark_logged_out();
        self.backend
            .finalize()
            .map_err(|err| SsmError::backend("C_Finalize", err))?;
        info!(backend = self.backend.id(), "token context finalized");
        Ok(())
    }
}

impl std::fmt::Debug for TokenContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenContext")
            .field("backend", &self.backend.id())
            .field("slot", &self.slot)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}
