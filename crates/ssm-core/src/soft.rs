//! In-process software token.
//!
//! Implements [`TokenBackend`] with real cipher and signature primitives so the whole engine can
//! run without a native module: unit tests, integration tests and `--backend soft` dry runs.
//! It follows PKCS#11 session semantics closely enough to exercise the pool: login state is
//! per token, closing the last session logs the user out, private objects are hidden from
//! unauthenticated searches and key usage flags are enforced.

use crate::{
    attributes::*,
    backend::{
        BackendError, BackendResult, ObjectHandle, ReturnValue, SessionHandle, SlotId,
        TokenBackend,
    },
    mechanism::{GcmParams, KeyType, Mechanism, MechanismType},
    secret::{SecretBytes, SecretString},
};
use aes::{Aes128, Aes192, Aes256};
use aes_gcm::{
    aead::{consts::U12, generic_array::GenericArray, Aead, Payload},
    Aes128Gcm, Aes256Gcm, AesGcm,
};
use cbc::cipher::{
    block_padding::{NoPadding, Pkcs7},
    BlockCipher, BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit,
};
use des::{Des, TdesEde2, TdesEde3};
use parking_lot::{Mutex, RwLock};
use rand::{rngs::OsRng, RngCore};
use rsa::{traits::PublicKeyParts, BigUint, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        mpsc,
    },
    time::Instant,
};
use tracing::debug;

type Aes192Gcm = AesGcm<Aes192, U12>;

const RSA_DEFAULT_EXPONENT: [u8; 3] = [0x01, 0x00, 0x01];

#[derive(Clone, Debug)]
struct SessionInfo {
    opened_at: Instant,
    search: Option<SearchCursor>,
}

#[derive(Clone, Debug)]
struct SearchCursor {
    queue: VecDeque<ObjectHandle>,
}

enum KeyMaterial {
    Secret(SecretBytes),
    RsaPrivate(Box<RsaPrivateKey>),
    RsaPublic(RsaPublicKey),
}

struct ObjectDescriptor {
    attributes: AttributeSet,
    material: KeyMaterial,
}

impl ObjectDescriptor {
    fn is_private(&self) -> bool {
        self.attributes.bool(CKA_PRIVATE).unwrap_or(false)
    }

    fn key_type(&self) -> Option<KeyType> {
        self.attributes.uint(CKA_KEY_TYPE).and_then(KeyType::from_code)
    }

    /// Usage flags default to false, as a token would for keys created without them.
    fn permits(&self, usage: AttributeId) -> bool {
        self.attributes.bool(usage).unwrap_or(false)
    }

    fn allows(&self, mechanism: MechanismType) -> bool {
        self.attributes
            .mechanisms()
            .map_or(true, |allowed| allowed.contains(&mechanism))
    }
}

pub struct SoftToken {
    slot_id: SlotId,
    pin: SecretString,
    initialized: AtomicBool,
    logged_in: RwLock<bool>,
    sessions: RwLock<HashMap<SessionHandle, SessionInfo>>,
    objects: RwLock<HashMap<ObjectHandle, ObjectDescriptor>>,
    next_session: AtomicU64,
    next_object: AtomicU64,
    disabled: RwLock<HashSet<MechanismType>>,
    injected: Mutex<HashMap<&'static str, ReturnValue>>,
    login_calls: AtomicUsize,
    open_gate: Mutex<Option<mpsc::Receiver<()>>>,
}

impl SoftToken {
    pub fn new(slot_id: SlotId, pin: impl Into<String>) -> Self {
        Self {
            slot_id,
            pin: SecretString::new(pin),
            initialized: AtomicBool::new(false),
            logged_in: RwLock::new(false),
            sessions: RwLock::new(HashMap::new()),
            objects: RwLock::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            next_object: AtomicU64::new(1),
            disabled: RwLock::new(HashSet::new()),
            injected: Mutex::new(HashMap::new()),
            login_calls: AtomicUsize::new(0),
            open_gate: Mutex::new(None),
        }
    }

    /// Make the token reject `mechanism` with CKR_MECHANISM_INVALID, like a module that lacks it.
    pub fn disable_mechanism(&self, mechanism: MechanismType) {
        self.disabled.write().insert(mechanism);
    }

    /// Fail the next call to `function` (e.g. `"C_CreateObject"`) with `rv`.
    pub fn inject_failure(&self, function: &'static str, rv: ReturnValue) {
        self.injected.lock().insert(function, rv);
    }

    /// Hold the next C_OpenSession until the returned sender fires or is dropped.
    pub fn stall_next_open(&self) -> mpsc::SyncSender<()> {
        let (resume, gate) = mpsc::sync_channel(1);
        *self.open_gate.lock() = Some(gate);
        resume
    }

    pub fn open_session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn object_count(&self) -> usize {
        self.objects.read().len()
    }

    /// Number of C_Login calls received, including rejected ones.
    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::Relaxed)
    }

    pub fn is_logged_in(&self) -> bool {
        *self.logged_in.read()
    }

    fn supported_mechanisms() -> impl Iterator<Item = MechanismType> {
        MechanismType::ALL.into_iter().filter(|mechanism| {
            !matches!(
                mechanism,
                MechanismType::DesEcbEncryptData
                    | MechanismType::Des3EcbEncryptData
                    | MechanismType::AesEcbEncryptData
                    | MechanismType::Des3Cmac
            )
        })
    }

    fn enter(&self, function: &'static str) -> BackendResult<()> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(BackendError::rv(
                function,
                ReturnValue::CryptokiNotInitialized,
            ));
        }
        if let Some(rv) = self.injected.lock().remove(function) {
            debug!(function, %rv, "soft token returning injected failure");
            return Err(BackendError::rv(function, rv));
        }
        Ok(())
    }

    fn check_session(&self, function: &'static str, session: SessionHandle) -> BackendResult<()> {
        self.enter(function)?;
        if self.sessions.read().contains_key(&session) {
            Ok(())
        } else {
            Err(BackendError::rv(function, ReturnValue::SessionHandleInvalid))
        }
    }

    fn check_user(&self, function: &'static str, session: SessionHandle) -> BackendResult<()> {
        self.check_session(function, session)?;
        if self.is_logged_in() {
            Ok(())
        } else {
            Err(BackendError::rv(function, ReturnValue::UserNotLoggedIn))
        }
    }

    fn check_mechanism(
        &self,
        function: &'static str,
        mechanism: MechanismType,
    ) -> BackendResult<()> {
        let advertised = Self::supported_mechanisms().any(|m| m == mechanism);
        if !advertised || self.disabled.read().contains(&mechanism) {
            return Err(BackendError::rv(function, ReturnValue::MechanismInvalid));
        }
        Ok(())
    }

    fn insert_object(&self, descriptor: ObjectDescriptor) -> ObjectHandle {
        let handle = self.next_object.fetch_add(1, Ordering::Relaxed);
        self.objects.write().insert(handle, descriptor);
        handle
    }

    /// Look up a key for a cipher or signature call and enforce its usage flags.
    fn with_key<T>(
        &self,
        function: &'static str,
        key: ObjectHandle,
        usage: AttributeId,
        mechanism: MechanismType,
        op: impl FnOnce(&ObjectDescriptor) -> BackendResult<T>,
    ) -> BackendResult<T> {
        let registry = self.objects.read();
        let descriptor = registry
            .get(&key)
            .ok_or_else(|| BackendError::rv(function, ReturnValue::ObjectHandleInvalid))?;
        if !descriptor.allows(mechanism) {
            return Err(BackendError::rv(function, ReturnValue::MechanismInvalid));
        }
        if !descriptor.permits(usage) {
            return Err(BackendError::rv(
                function,
                ReturnValue::KeyFunctionNotPermitted,
            ));
        }
        op(descriptor)
    }

    fn cipher(
        &self,
        function: &'static str,
        session: SessionHandle,
        mechanism: &Mechanism,
        key: ObjectHandle,
        data: &[u8],
        direction: Direction,
    ) -> BackendResult<SecretBytes> {
        self.check_user(function, session)?;
        let mechanism_type = mechanism.mechanism_type();
        self.check_mechanism(function, mechanism_type)?;
        let usage = match direction {
            Direction::Encrypt => CKA_ENCRYPT,
            Direction::Decrypt => CKA_DECRYPT,
        };
        self.with_key(function, key, usage, mechanism_type, |descriptor| {
            let KeyMaterial::Secret(secret) = &descriptor.material else {
                return Err(BackendError::rv(function, ReturnValue::KeyTypeInconsistent));
            };
            let key_type = descriptor
                .key_type()
                .ok_or_else(|| BackendError::rv(function, ReturnValue::KeyTypeInconsistent))?;
            let (family, mode) = block_mode(function, mechanism)?;
            if family != key_type {
                return Err(BackendError::rv(function, ReturnValue::KeyTypeInconsistent));
            }
            match mode {
                Mode::Gcm(params) => gcm(function, secret.expose(), params, data, direction),
                mode => block_cipher(function, key_type, secret.expose(), mode, data, direction),
            }
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Encrypt,
    Decrypt,
}

#[derive(Clone, Copy)]
enum Mode<'a> {
    CbcPad(&'a [u8]),
    Cbc(&'a [u8]),
    Ecb,
    Gcm(&'a GcmParams),
}

fn block_mode<'m>(
    function: &'static str,
    mechanism: &'m Mechanism,
) -> BackendResult<(KeyType, Mode<'m>)> {
    let resolved = match mechanism {
        Mechanism::AesCbcPad(iv) => (KeyType::Aes, Mode::CbcPad(iv)),
        Mechanism::AesCbc(iv) => (KeyType::Aes, Mode::Cbc(iv)),
        Mechanism::AesEcb => (KeyType::Aes, Mode::Ecb),
        Mechanism::AesGcm(params) => (KeyType::Aes, Mode::Gcm(params)),
        Mechanism::DesCbcPad(iv) => (KeyType::Des, Mode::CbcPad(iv)),
        Mechanism::DesCbc(iv) => (KeyType::Des, Mode::Cbc(iv)),
        Mechanism::DesEcb => (KeyType::Des, Mode::Ecb),
        Mechanism::Des3CbcPad(iv) => (KeyType::Des3, Mode::CbcPad(iv)),
        Mechanism::Des3Cbc(iv) => (KeyType::Des3, Mode::Cbc(iv)),
        Mechanism::Des3Ecb => (KeyType::Des3, Mode::Ecb),
        _ => return Err(BackendError::rv(function, ReturnValue::MechanismInvalid)),
    };
    Ok(resolved)
}

fn block_cipher(
    function: &'static str,
    key_type: KeyType,
    key: &[u8],
    mode: Mode<'_>,
    data: &[u8],
    direction: Direction,
) -> BackendResult<SecretBytes> {
    match (key_type, key.len()) {
        (KeyType::Aes, 16) => run_block::<Aes128>(function, key, mode, data, direction),
        (KeyType::Aes, 24) => run_block::<Aes192>(function, key, mode, data, direction),
        (KeyType::Aes, 32) => run_block::<Aes256>(function, key, mode, data, direction),
        (KeyType::Des, 8) => run_block::<Des>(function, key, mode, data, direction),
        (KeyType::Des3, 16) => run_block::<TdesEde2>(function, key, mode, data, direction),
        (KeyType::Des3, 24) => run_block::<TdesEde3>(function, key, mode, data, direction),
        _ => Err(BackendError::rv(function, ReturnValue::GeneralError)),
    }
}

fn run_block<C>(
    function: &'static str,
    key: &[u8],
    mode: Mode<'_>,
    data: &[u8],
    direction: Direction,
) -> BackendResult<SecretBytes>
where
    C: BlockCipher + BlockEncryptMut + BlockDecryptMut + KeyInit,
{
    let block = C::block_size();
    let aligned = data.len() % block == 0;
    let length_error = match direction {
        Direction::Encrypt => ReturnValue::DataLenRange,
        Direction::Decrypt => ReturnValue::EncryptedDataLenRange,
    };
    let unpadded = matches!(mode, Mode::Cbc(_) | Mode::Ecb);
    if (unpadded || direction == Direction::Decrypt) && !aligned {
        return Err(BackendError::rv(function, length_error));
    }
    let bad_param = |_| BackendError::rv(function, ReturnValue::MechanismParamInvalid);
    let out = match (mode, direction) {
        (Mode::CbcPad(iv), Direction::Encrypt) => cbc::Encryptor::<C>::new_from_slices(key, iv)
            .map_err(bad_param)?
            .encrypt_padded_vec_mut::<Pkcs7>(data),
        (Mode::Cbc(iv), Direction::Encrypt) => cbc::Encryptor::<C>::new_from_slices(key, iv)
            .map_err(bad_param)?
            .encrypt_padded_vec_mut::<NoPadding>(data),
        (Mode::Ecb, Direction::Encrypt) => ecb::Encryptor::<C>::new_from_slice(key)
            .map_err(bad_param)?
            .encrypt_padded_vec_mut::<NoPadding>(data),
        (Mode::CbcPad(iv), Direction::Decrypt) => cbc::Decryptor::<C>::new_from_slices(key, iv)
            .map_err(bad_param)?
            .decrypt_padded_vec_mut::<Pkcs7>(data)
            .map_err(|_| BackendError::rv(function, ReturnValue::EncryptedDataInvalid))?,
        (Mode::Cbc(iv), Direction::Decrypt) => cbc::Decryptor::<C>::new_from_slices(key, iv)
            .map_err(bad_param)?
            .decrypt_padded_vec_mut::<NoPadding>(data)
            .map_err(|_| BackendError::rv(function, ReturnValue::EncryptedDataInvalid))?,
        (Mode::Ecb, Direction::Decrypt) => ecb::Decryptor::<C>::new_from_slice(key)
            .map_err(bad_param)?
            .decrypt_padded_vec_mut::<NoPadding>(data)
            .map_err(|_| BackendError::rv(function, ReturnValue::EncryptedDataInvalid))?,
        (Mode::Gcm(_), _) => return Err(BackendError::rv(function, ReturnValue::MechanismInvalid)),
    };
    Ok(SecretBytes::new(out))
}

fn gcm(
    function: &'static str,
    key: &[u8],
    params: &GcmParams,
    data: &[u8],
    direction: Direction,
) -> BackendResult<SecretBytes> {
    if params.iv.len() != 12 || params.tag_bits != 128 {
        return Err(BackendError::rv(function, ReturnValue::MechanismParamInvalid));
    }
    match key.len() {
        16 => run_gcm::<Aes128Gcm>(function, key, params, data, direction),
        24 => run_gcm::<Aes192Gcm>(function, key, params, data, direction),
        32 => run_gcm::<Aes256Gcm>(function, key, params, data, direction),
        _ => Err(BackendError::rv(function, ReturnValue::GeneralError)),
    }
}

fn run_gcm<A>(
    function: &'static str,
    key: &[u8],
    params: &GcmParams,
    data: &[u8],
    direction: Direction,
) -> BackendResult<SecretBytes>
where
    A: Aead + KeyInit,
{
    let cipher = A::new_from_slice(key)
        .map_err(|_| BackendError::rv(function, ReturnValue::GeneralError))?;
    let nonce = GenericArray::from_slice(&params.iv);
    let payload = Payload {
        msg: data,
        aad: &params.aad,
    };
    let out = match direction {
        Direction::Encrypt => cipher
            .encrypt(nonce, payload)
            .map_err(|_| BackendError::rv(function, ReturnValue::GeneralError))?,
        Direction::Decrypt => cipher
            .decrypt(nonce, payload)
            .map_err(|_| BackendError::rv(function, ReturnValue::EncryptedDataInvalid))?,
    };
    Ok(SecretBytes::new(out))
}

fn rsa_public(
    function: &'static str,
    material: &KeyMaterial,
) -> BackendResult<RsaPublicKey> {
    match material {
        KeyMaterial::RsaPrivate(key) => Ok(key.to_public_key()),
        KeyMaterial::RsaPublic(key) => Ok(key.clone()),
        KeyMaterial::Secret(_) => Err(BackendError::rv(function, ReturnValue::KeyTypeInconsistent)),
    }
}

impl TokenBackend for SoftToken {
    fn id(&self) -> &'static str {
        "soft"
    }

    fn initialize(&self) -> BackendResult<()> {
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn finalize(&self) -> BackendResult<()> {
        self.enter("C_Finalize")?;
        self.sessions.write().clear();
        *self.logged_in.write() = false;
        self.initialized.store(false, Ordering::Release);
        Ok(())
    }

    fn mechanisms(&self, slot: SlotId) -> BackendResult<Vec<MechanismType>> {
        self.enter("C_GetMechanismList")?;
        if slot != self.slot_id {
            return Err(BackendError::rv("C_GetMechanismList", ReturnValue::SlotIdInvalid));
        }
        let disabled = self.disabled.read();
        Ok(Self::supported_mechanisms()
            .filter(|mechanism| !disabled.contains(mechanism))
            .collect())
    }

    fn open_session(&self, slot: SlotId) -> BackendResult<SessionHandle> {
        self.enter("C_OpenSession")?;
        let gate = self.open_gate.lock().take();
        if let Some(gate) = gate {
            // A dropped sender resumes the call too.
            let _ = gate.recv();
        }
        if slot != self.slot_id {
            return Err(BackendError::rv("C_OpenSession", ReturnValue::SlotIdInvalid));
        }
        let handle = self.next_session.fetch_add(1, Ordering::Relaxed);
        let info = SessionInfo {
            opened_at: Instant::now(),
            search: None,
        };
        self.sessions.write().insert(handle, info);
        Ok(handle)
    }

    fn close_session(&self, session: SessionHandle) -> BackendResult<()> {
        self.enter("C_CloseSession")?;
        let mut sessions = self.sessions.write();
        let info = sessions
            .remove(&session)
            .ok_or_else(|| BackendError::rv("C_CloseSession", ReturnValue::SessionHandleInvalid))?;
        debug!(session, age = ?info.opened_at.elapsed(), "soft session closed");
        if sessions.is_empty() {
            *self.logged_in.write() = false;
        }
        Ok(())
    }

    fn close_all_sessions(&self, slot: SlotId) -> BackendResult<()> {
        self.enter("C_CloseAllSessions")?;
        if slot != self.slot_id {
            return Err(BackendError::rv("C_CloseAllSessions", ReturnValue::SlotIdInvalid));
        }
        self.sessions.write().clear();
        *self.logged_in.write() = false;
        Ok(())
    }

    fn login(&self, session: SessionHandle, pin: &SecretString) -> BackendResult<()> {
        self.login_calls.fetch_add(1, Ordering::Relaxed);
        self.check_session("C_Login", session)?;
        let mut logged_in = self.logged_in.write();
        if *logged_in {
            return Err(BackendError::rv("C_Login", ReturnValue::UserAlreadyLoggedIn));
        }
        if pin.expose() != self.pin.expose() {
            return Err(BackendError::rv("C_Login", ReturnValue::PinIncorrect));
        }
        *logged_in = true;
        Ok(())
    }

    fn logout(&self, session: SessionHandle) -> BackendResult<()> {
        self.check_session("C_Logout", session)?;
        let mut logged_in = self.logged_in.write();
        if !*logged_in {
            return Err(BackendError::rv("C_Logout", ReturnValue::UserNotLoggedIn));
        }
        *logged_in = false;
        Ok(())
    }

    fn find_objects_init(
        &self,
        session: SessionHandle,
        template: &AttributeTemplate,
    ) -> BackendResult<()> {
        self.check_session("C_FindObjectsInit", session)?;
        let show_private = self.is_logged_in();
        let mut sessions = self.sessions.write();
        let info = sessions
            .get_mut(&session)
            .ok_or_else(|| BackendError::rv("C_FindObjectsInit", ReturnValue::SessionHandleInvalid))?;
        if info.search.is_some() {
            return Err(BackendError::rv("C_FindObjectsInit", ReturnValue::OperationActive));
        }

        let registry = self.objects.read();
        let mut matches: Vec<ObjectHandle> = registry
            .iter()
            .filter(|(_, descriptor)| show_private || !descriptor.is_private())
            .filter(|(_, descriptor)| descriptor.attributes.matches_template(template))
            .map(|(handle, _)| *handle)
            .collect();
        matches.sort_unstable();
        info.search = Some(SearchCursor {
            queue: matches.into(),
        });
        Ok(())
    }

    fn find_objects(&self, session: SessionHandle, max: usize) -> BackendResult<Vec<ObjectHandle>> {
        self.check_session("C_FindObjects", session)?;
        let mut sessions = self.sessions.write();
        let cursor = sessions
            .get_mut(&session)
            .and_then(|info| info.search.as_mut())
            .ok_or_else(|| BackendError::rv("C_FindObjects", ReturnValue::OperationNotInitialized))?;
        let limit = max.max(1).min(cursor.queue.len());
        Ok(cursor.queue.drain(..limit).collect())
    }

    fn find_objects_final(&self, session: SessionHandle) -> BackendResult<()> {
        self.check_session("C_FindObjectsFinal", session)?;
        let mut sessions = self.sessions.write();
        let info = sessions
            .get_mut(&session)
            .ok_or_else(|| BackendError::rv("C_FindObjectsFinal", ReturnValue::SessionHandleInvalid))?;
        info.search
            .take()
            .map(|_| ())
            .ok_or_else(|| BackendError::rv("C_FindObjectsFinal", ReturnValue::OperationNotInitialized))
    }

    fn create_object(
        &self,
        session: SessionHandle,
        template: &AttributeTemplate,
    ) -> BackendResult<ObjectHandle> {
        const F: &str = "C_CreateObject";
        self.check_user(F, session)?;
        let mut attributes = AttributeSet::from_template(template);
        attributes
            .validate_required(&[CKA_CLASS, CKA_KEY_TYPE, CKA_VALUE])
            .map_err(|_| BackendError::rv(F, ReturnValue::TemplateIncomplete))?;
        if attributes.uint(CKA_CLASS) != Some(CKO_SECRET_KEY) {
            return Err(BackendError::rv(F, ReturnValue::TemplateInconsistent));
        }
        let key_type = attributes
            .uint(CKA_KEY_TYPE)
            .and_then(KeyType::from_code)
            .ok_or_else(|| BackendError::rv(F, ReturnValue::AttributeValueInvalid))?;
        let value = match attributes.remove(CKA_VALUE) {
            Some(AttributeValue::Bytes(value)) => SecretBytes::new(value),
            _ => return Err(BackendError::rv(F, ReturnValue::AttributeValueInvalid)),
        };
        key_type
            .check_key_len(value.len())
            .map_err(|_| BackendError::rv(F, ReturnValue::AttributeValueInvalid))?;
        attributes.insert(CKA_VALUE_LEN, AttributeValue::Uint(value.len() as u64));
        Ok(self.insert_object(ObjectDescriptor {
            attributes,
            material: KeyMaterial::Secret(value),
        }))
    }

    fn destroy_object(&self, session: SessionHandle, object: ObjectHandle) -> BackendResult<()> {
        self.check_user("C_DestroyObject", session)?;
        self.objects
            .write()
            .remove(&object)
            .map(|_| ())
            .ok_or_else(|| BackendError::rv("C_DestroyObject", ReturnValue::ObjectHandleInvalid))
    }

    fn get_attributes(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        attributes: &[AttributeId],
    ) -> BackendResult<AttributeSet> {
        self.check_session("C_GetAttributeValue", session)?;
        let show_private = self.is_logged_in();
        let registry = self.objects.read();
        let descriptor = registry
            .get(&object)
            .filter(|descriptor| show_private || !descriptor.is_private())
            .ok_or_else(|| BackendError::rv("C_GetAttributeValue", ReturnValue::ObjectHandleInvalid))?;

        let mut out = AttributeSet::new();
        for id in attributes {
            if *id == CKA_VALUE {
                let readable = !descriptor.attributes.bool(CKA_SENSITIVE).unwrap_or(false)
                    && descriptor.attributes.bool(CKA_EXTRACTABLE).unwrap_or(true);
                if let (true, KeyMaterial::Secret(secret)) = (readable, &descriptor.material) {
                    out.insert(CKA_VALUE, AttributeValue::Bytes(secret.expose().to_vec()));
                }
                continue;
            }
            if let Some(value) = descriptor.attributes.get(*id) {
                out.insert(*id, value.clone());
            }
        }
        Ok(out)
    }

    fn generate_key(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        template: &AttributeTemplate,
    ) -> BackendResult<ObjectHandle> {
        const F: &str = "C_GenerateKey";
        self.check_user(F, session)?;
        self.check_mechanism(F, mechanism.mechanism_type())?;
        let (key_type, len) = match mechanism {
            Mechanism::AesKeyGen => {
                let len = match template.get(CKA_VALUE_LEN) {
                    Some(AttributeValue::Uint(len)) => *len as usize,
                    _ => return Err(BackendError::rv(F, ReturnValue::TemplateIncomplete)),
                };
                (KeyType::Aes, len)
            }
            Mechanism::DesKeyGen => (KeyType::Des, 8),
            Mechanism::Des3KeyGen => (KeyType::Des3, 24),
            _ => return Err(BackendError::rv(F, ReturnValue::MechanismInvalid)),
        };
        key_type
            .check_key_len(len)
            .map_err(|_| BackendError::rv(F, ReturnValue::AttributeValueInvalid))?;

        let mut attributes = AttributeSet::from_template(template);
        if let Some(requested) = attributes.uint(CKA_KEY_TYPE) {
            if requested != key_type.code() {
                return Err(BackendError::rv(F, ReturnValue::TemplateInconsistent));
            }
        }
        attributes.insert(CKA_CLASS, AttributeValue::Uint(CKO_SECRET_KEY));
        attributes.insert(CKA_KEY_TYPE, AttributeValue::Uint(key_type.code()));
        attributes.insert(CKA_VALUE_LEN, AttributeValue::Uint(len as u64));

        let mut value = SecretBytes::new(vec![0u8; len]);
        OsRng.fill_bytes(value.expose_mut());
        Ok(self.insert_object(ObjectDescriptor {
            attributes,
            material: KeyMaterial::Secret(value),
        }))
    }

    fn generate_key_pair(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        public_template: &AttributeTemplate,
        private_template: &AttributeTemplate,
    ) -> BackendResult<(ObjectHandle, ObjectHandle)> {
        const F: &str = "C_GenerateKeyPair";
        self.check_user(F, session)?;
        self.check_mechanism(F, mechanism.mechanism_type())?;
        if *mechanism != Mechanism::RsaPkcsKeyPairGen {
            return Err(BackendError::rv(F, ReturnValue::MechanismInvalid));
        }
        let bits = match public_template.get(CKA_MODULUS_BITS) {
            Some(AttributeValue::Uint(bits)) => *bits as usize,
            _ => return Err(BackendError::rv(F, ReturnValue::TemplateIncomplete)),
        };
        let exponent = match public_template.get(CKA_PUBLIC_EXPONENT) {
            Some(AttributeValue::Bytes(exponent)) => exponent.clone(),
            _ => RSA_DEFAULT_EXPONENT.to_vec(),
        };
        let private = RsaPrivateKey::new_with_exp(&mut OsRng, bits, &BigUint::from_bytes_be(&exponent))
            .map_err(|_| BackendError::rv(F, ReturnValue::AttributeValueInvalid))?;
        let public = private.to_public_key();
        let modulus = AttributeValue::Bytes(public.n().to_bytes_be());
        let exponent = AttributeValue::Bytes(public.e().to_bytes_be());

        let mut public_attrs = AttributeSet::from_template(public_template);
        public_attrs.insert(CKA_CLASS, AttributeValue::Uint(CKO_PUBLIC_KEY));
        public_attrs.insert(CKA_KEY_TYPE, AttributeValue::Uint(CKK_RSA));
        public_attrs.insert(CKA_MODULUS, modulus.clone());
        public_attrs.insert(CKA_PUBLIC_EXPONENT, exponent.clone());

        let mut private_attrs = AttributeSet::from_template(private_template);
        private_attrs.insert(CKA_CLASS, AttributeValue::Uint(CKO_PRIVATE_KEY));
        private_attrs.insert(CKA_KEY_TYPE, AttributeValue::Uint(CKK_RSA));
        private_attrs.insert(CKA_MODULUS, modulus);
        private_attrs.insert(CKA_PUBLIC_EXPONENT, exponent);

        let public_handle = self.insert_object(ObjectDescriptor {
            attributes: public_attrs,
            material: KeyMaterial::RsaPublic(public),
        });
        let private_handle = self.insert_object(ObjectDescriptor {
            attributes: private_attrs,
            material: KeyMaterial::RsaPrivate(Box::new(private)),
        });
        Ok((public_handle, private_handle))
    }

    fn encrypt(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> BackendResult<Vec<u8>> {
        // Ciphertext is not secret; move it out of the wrapper.
        self.cipher("C_Encrypt", session, mechanism, key, data, Direction::Encrypt)
            .map(|ciphertext| ciphertext.expose().to_vec())
    }

    fn decrypt(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> BackendResult<SecretBytes> {
        self.cipher("C_Decrypt", session, mechanism, key, data, Direction::Decrypt)
    }

    fn sign(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> BackendResult<Vec<u8>> {
        const F: &str = "C_Sign";
        self.check_user(F, session)?;
        let mechanism_type = mechanism.mechanism_type();
        self.check_mechanism(F, mechanism_type)?;
        self.with_key(F, key, CKA_SIGN, mechanism_type, |descriptor| {
            let KeyMaterial::RsaPrivate(private) = &descriptor.material else {
                return Err(BackendError::rv(F, ReturnValue::KeyTypeInconsistent));
            };
            let signed = match mechanism {
                Mechanism::Sha256RsaPkcs => private.sign_with_rng(
                    &mut OsRng,
                    Pkcs1v15Sign::new::<Sha256>(),
                    &Sha256::digest(data),
                ),
                Mechanism::RsaPkcs => {
                    private.sign_with_rng(&mut OsRng, Pkcs1v15Sign::new_unprefixed(), data)
                }
                _ => return Err(BackendError::rv(F, ReturnValue::MechanismInvalid)),
            };
            signed.map_err(|_| BackendError::rv(F, ReturnValue::DataLenRange))
        })
    }

    fn verify(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        key: ObjectHandle,
        data: &[u8],
        signature: &[u8],
    ) -> BackendResult<()> {
        const F: &str = "C_Verify";
        self.check_session(F, session)?;
        let mechanism_type = mechanism.mechanism_type();
        self.check_mechanism(F, mechanism_type)?;
        self.with_key(F, key, CKA_VERIFY, mechanism_type, |descriptor| {
            let public = rsa_public(F, &descriptor.material)?;
            let checked = match mechanism {
                Mechanism::Sha256RsaPkcs => public.verify(
                    Pkcs1v15Sign::new::<Sha256>(),
                    &Sha256::digest(data),
                    signature,
                ),
                Mechanism::RsaPkcs => public.verify(Pkcs1v15Sign::new_unprefixed(), data, signature),
                _ => return Err(BackendError::rv(F, ReturnValue::MechanismInvalid)),
            };
            checked.map_err(|_| BackendError::rv(F, ReturnValue::SignatureInvalid))
        })
    }
}
