//! [`TokenBackend`] over a native PKCS#11 module loaded with `cryptoki`.
//!
//! cryptoki object handles cannot be built from raw integers, so each session keeps a table
//! from the engine's numeric handles to the cryptoki handles it has seen. The table dies with
//! the session, which matches the scope of PKCS#11 object handles.

use crate::{
    attributes::*,
    backend::{
        BackendError, BackendResult, ObjectHandle, ReturnValue, SessionHandle, SlotId,
        TokenBackend,
    },
    mechanism::{Mechanism, MechanismType},
    secret::{SecretBytes, SecretString},
};
use cryptoki::{
    context::{CInitializeArgs, Pkcs11},
    error::{Error as CkError, RvError},
    mechanism::{aead::GcmParams as CkGcmParams, Mechanism as CkMechanism, MechanismType as CkMechanismType},
    object::{Attribute, AttributeType, KeyType as CkKeyType, ObjectClass, ObjectHandle as CkObjectHandle},
    session::{Session, UserType},
    slot::Slot,
    types::{AuthPin, Ulong},
};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{debug, info, warn};
use zeroize::Zeroize;

struct SessionEntry {
    slot: SlotId,
    session: Session,
    objects: HashMap<ObjectHandle, CkObjectHandle>,
    known: Vec<(CkObjectHandle, ObjectHandle)>,
    cursor: Option<VecDeque<ObjectHandle>>,
}

impl SessionEntry {
    fn resolve(&self, function: &'static str, object: ObjectHandle) -> BackendResult<CkObjectHandle> {
        self.objects
            .get(&object)
            .copied()
            .ok_or_else(|| BackendError::rv(function, ReturnValue::ObjectHandleInvalid))
    }

    fn register(&mut self, next: &AtomicU64, handle: CkObjectHandle) -> ObjectHandle {
        if let Some((_, existing)) = self.known.iter().find(|(known, _)| *known == handle) {
            return *existing;
        }
        let id = next.fetch_add(1, Ordering::Relaxed);
        self.objects.insert(id, handle);
        self.known.push((handle, id));
        id
    }

    fn forget(&mut self, object: ObjectHandle) {
        if let Some(handle) = self.objects.remove(&object) {
            self.known.retain(|(known, _)| *known != handle);
        }
    }
}

pub struct Pkcs11Backend {
    module_path: PathBuf,
    context: RwLock<Option<Pkcs11>>,
    sessions: RwLock<HashMap<SessionHandle, Arc<Mutex<SessionEntry>>>>,
    next_session: AtomicU64,
    next_object: AtomicU64,
}

impl Pkcs11Backend {
    pub fn new(module_path: impl AsRef<Path>) -> Self {
        Self {
            module_path: module_path.as_ref().to_path_buf(),
            context: RwLock::new(None),
            sessions: RwLock::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            next_object: AtomicU64::new(1),
        }
    }

    pub fn module_path(&self) -> &Path {
        &self.module_path
    }

    fn slot(&self, function: &'static str, slot: SlotId) -> BackendResult<(Pkcs11, Slot)> {
        let guard = self.context.read();
        let context = guard
            .as_ref()
            .ok_or_else(|| BackendError::rv(function, ReturnValue::CryptokiNotInitialized))?;
        let found = context
            .get_slots_with_token()
            .map_err(ck_error(function))?
            .into_iter()
            .find(|candidate| candidate.id() == slot)
            .ok_or_else(|| BackendError::rv(function, ReturnValue::SlotIdInvalid))?;
        Ok((context.clone(), found))
    }

    fn entry(&self, function: &'static str, session: SessionHandle) -> BackendResult<Arc<Mutex<SessionEntry>>> {
        self.sessions
            .read()
            .get(&session)
            .cloned()
            .ok_or_else(|| BackendError::rv(function, ReturnValue::SessionHandleInvalid))
    }

    fn with_session<T>(
        &self,
        function: &'static str,
        session: SessionHandle,
        op: impl FnOnce(&mut SessionEntry) -> BackendResult<T>,
    ) -> BackendResult<T> {
        let entry = self.entry(function, session)?;
        let mut guard = entry.lock();
        op(&mut guard)
    }
}

fn ck_error(function: &'static str) -> impl Fn(CkError) -> BackendError {
    move |err| match err {
        CkError::Pkcs11(rv, _) => match return_value(rv) {
            Some(rv) => BackendError::rv(function, rv),
            None => BackendError::Module(format!("{function} returned {rv}")),
        },
        other => BackendError::module(other),
    }
}

fn return_value(rv: RvError) -> Option<ReturnValue> {
    let mapped = match rv {
        RvError::UserAlreadyLoggedIn => ReturnValue::UserAlreadyLoggedIn,
        RvError::UserNotLoggedIn => ReturnValue::UserNotLoggedIn,
        RvError::PinIncorrect => ReturnValue::PinIncorrect,
        RvError::SlotIdInvalid => ReturnValue::SlotIdInvalid,
        RvError::SessionHandleInvalid => ReturnValue::SessionHandleInvalid,
        RvError::ObjectHandleInvalid => ReturnValue::ObjectHandleInvalid,
        RvError::MechanismInvalid => ReturnValue::MechanismInvalid,
        RvError::MechanismParamInvalid => ReturnValue::MechanismParamInvalid,
        RvError::KeyTypeInconsistent => ReturnValue::KeyTypeInconsistent,
        RvError::KeyFunctionNotPermitted => ReturnValue::KeyFunctionNotPermitted,
        RvError::FunctionNotSupported => ReturnValue::FunctionNotSupported,
        RvError::DataLenRange => ReturnValue::DataLenRange,
        RvError::DataInvalid => ReturnValue::DataInvalid,
        RvError::EncryptedDataInvalid => ReturnValue::EncryptedDataInvalid,
        RvError::EncryptedDataLenRange => ReturnValue::EncryptedDataLenRange,
        RvError::SignatureInvalid => ReturnValue::SignatureInvalid,
        RvError::TemplateIncomplete => ReturnValue::TemplateIncomplete,
        RvError::TemplateInconsistent => ReturnValue::TemplateInconsistent,
        RvError::AttributeSensitive => ReturnValue::AttributeSensitive,
        RvError::AttributeValueInvalid => ReturnValue::AttributeValueInvalid,
        RvError::OperationActive => ReturnValue::OperationActive,
        RvError::OperationNotInitialized => ReturnValue::OperationNotInitialized,
        RvError::CryptokiNotInitialized => ReturnValue::CryptokiNotInitialized,
        RvError::GeneralError => ReturnValue::GeneralError,
        _ => return None,
    };
    Some(mapped)
}

fn to_mechanism<'a>(function: &'static str, mechanism: &'a Mechanism) -> BackendResult<CkMechanism<'a>> {
    let converted = match mechanism {
        Mechanism::RsaPkcsKeyPairGen => CkMechanism::RsaPkcsKeyPairGen,
        Mechanism::RsaPkcs => CkMechanism::RsaPkcs,
        Mechanism::Sha256RsaPkcs => CkMechanism::Sha256RsaPkcs,
        Mechanism::DesKeyGen => CkMechanism::DesKeyGen,
        Mechanism::Des3KeyGen => CkMechanism::Des3KeyGen,
        Mechanism::AesKeyGen => CkMechanism::AesKeyGen,
        Mechanism::DesEcb => CkMechanism::DesEcb,
        Mechanism::DesCbc(iv) => CkMechanism::DesCbc(*iv),
        Mechanism::DesCbcPad(iv) => CkMechanism::DesCbcPad(*iv),
        Mechanism::Des3Ecb => CkMechanism::Des3Ecb,
        Mechanism::Des3Cbc(iv) => CkMechanism::Des3Cbc(*iv),
        Mechanism::Des3CbcPad(iv) => CkMechanism::Des3CbcPad(*iv),
        Mechanism::AesEcb => CkMechanism::AesEcb,
        Mechanism::AesCbc(iv) => CkMechanism::AesCbc(*iv),
        Mechanism::AesCbcPad(iv) => CkMechanism::AesCbcPad(*iv),
        Mechanism::AesGcm(params) => CkMechanism::AesGcm(CkGcmParams::new(
            &params.iv,
            &params.aad,
            Ulong::from(u64::from(params.tag_bits)),
        )),
        // Key derivation mechanisms; the token would fail C_EncryptInit with them.
        Mechanism::DesEcbEncryptData
        | Mechanism::Des3EcbEncryptData
        | Mechanism::AesEcbEncryptData => {
            return Err(BackendError::rv(function, ReturnValue::MechanismInvalid))
        }
    };
    Ok(converted)
}

fn object_class(function: &'static str, code: u64) -> BackendResult<ObjectClass> {
    match code {
        CKO_PUBLIC_KEY => Ok(ObjectClass::PUBLIC_KEY),
        CKO_PRIVATE_KEY => Ok(ObjectClass::PRIVATE_KEY),
        CKO_SECRET_KEY => Ok(ObjectClass::SECRET_KEY),
        _ => Err(BackendError::rv(function, ReturnValue::AttributeValueInvalid)),
    }
}

fn key_type(function: &'static str, code: u64) -> BackendResult<CkKeyType> {
    match code {
        CKK_RSA => Ok(CkKeyType::RSA),
        0x13 => Ok(CkKeyType::DES),
        0x15 => Ok(CkKeyType::DES3),
        0x1f => Ok(CkKeyType::AES),
        _ => Err(BackendError::rv(function, ReturnValue::AttributeValueInvalid)),
    }
}

fn attribute_type(id: AttributeId) -> Option<AttributeType> {
    let converted = match id {
        CKA_CLASS => AttributeType::Class,
        CKA_TOKEN => AttributeType::Token,
        CKA_PRIVATE => AttributeType::Private,
        CKA_LABEL => AttributeType::Label,
        CKA_VALUE => AttributeType::Value,
        CKA_KEY_TYPE => AttributeType::KeyType,
        CKA_ID => AttributeType::Id,
        CKA_SENSITIVE => AttributeType::Sensitive,
        CKA_ENCRYPT => AttributeType::Encrypt,
        CKA_DECRYPT => AttributeType::Decrypt,
        CKA_WRAP => AttributeType::Wrap,
        CKA_UNWRAP => AttributeType::Unwrap,
        CKA_SIGN => AttributeType::Sign,
        CKA_VERIFY => AttributeType::Verify,
        CKA_MODULUS => AttributeType::Modulus,
        CKA_MODULUS_BITS => AttributeType::ModulusBits,
        CKA_PUBLIC_EXPONENT => AttributeType::PublicExponent,
        CKA_VALUE_LEN => AttributeType::ValueLen,
        CKA_EXTRACTABLE => AttributeType::Extractable,
        CKA_ALLOWED_MECHANISMS => AttributeType::AllowedMechanisms,
        _ => return None,
    };
    Some(converted)
}

/// cryptoki template that wipes `CKA_VALUE` bytes once the call returns.
struct CkTemplate(Vec<Attribute>);

impl CkTemplate {
    fn convert(function: &'static str, template: &AttributeTemplate) -> BackendResult<Self> {
        let mut out = Self(Vec::with_capacity(template.entries().len()));
        for (id, value) in template.entries() {
            out.0.push(to_attribute(function, *id, value)?);
        }
        Ok(out)
    }
}

impl Drop for CkTemplate {
    fn drop(&mut self) {
        for attribute in &mut self.0 {
            if let Attribute::Value(bytes) = attribute {
                bytes.zeroize();
            }
        }
    }
}

fn to_attribute(function: &'static str, id: AttributeId, value: &AttributeValue) -> BackendResult<Attribute> {
    let attribute = match (id, value) {
        (CKA_CLASS, AttributeValue::Uint(code)) => Attribute::Class(object_class(function, *code)?),
        (CKA_KEY_TYPE, AttributeValue::Uint(code)) => Attribute::KeyType(key_type(function, *code)?),
        (CKA_TOKEN, AttributeValue::Bool(flag)) => Attribute::Token(*flag),
        (CKA_PRIVATE, AttributeValue::Bool(flag)) => Attribute::Private(*flag),
        (CKA_SENSITIVE, AttributeValue::Bool(flag)) => Attribute::Sensitive(*flag),
        (CKA_EXTRACTABLE, AttributeValue::Bool(flag)) => Attribute::Extractable(*flag),
        (CKA_ENCRYPT, AttributeValue::Bool(flag)) => Attribute::Encrypt(*flag),
        (CKA_DECRYPT, AttributeValue::Bool(flag)) => Attribute::Decrypt(*flag),
        (CKA_WRAP, AttributeValue::Bool(flag)) => Attribute::Wrap(*flag),
        (CKA_UNWRAP, AttributeValue::Bool(flag)) => Attribute::Unwrap(*flag),
        (CKA_SIGN, AttributeValue::Bool(flag)) => Attribute::Sign(*flag),
        (CKA_VERIFY, AttributeValue::Bool(flag)) => Attribute::Verify(*flag),
        (CKA_LABEL, AttributeValue::Bytes(bytes)) => Attribute::Label(bytes.clone()),
        (CKA_ID, AttributeValue::Bytes(bytes)) => Attribute::Id(bytes.clone()),
        (CKA_VALUE, AttributeValue::Bytes(bytes)) => Attribute::Value(bytes.clone()),
        (CKA_MODULUS, AttributeValue::Bytes(bytes)) => Attribute::Modulus(bytes.clone()),
        (CKA_PUBLIC_EXPONENT, AttributeValue::Bytes(bytes)) => Attribute::PublicExponent(bytes.clone()),
        (CKA_VALUE_LEN, AttributeValue::Uint(len)) => Attribute::ValueLen(Ulong::from(*len)),
        (CKA_MODULUS_BITS, AttributeValue::Uint(bits)) => Attribute::ModulusBits(Ulong::from(*bits)),
        (CKA_ALLOWED_MECHANISMS, AttributeValue::Mechanisms(list)) => {
            let mut converted = Vec::with_capacity(list.len());
            for mechanism in list {
                match CkMechanismType::try_from(mechanism.code()) {
                    Ok(ck) => converted.push(ck),
                    Err(_) => warn!(%mechanism, "module does not know mechanism, left out of allowed list"),
                }
            }
            Attribute::AllowedMechanisms(converted)
        }
        _ => return Err(BackendError::rv(function, ReturnValue::TemplateInconsistent)),
    };
    Ok(attribute)
}

fn from_attribute(attribute: Attribute) -> Option<(AttributeId, AttributeValue)> {
    let converted = match attribute {
        Attribute::Class(class) => (CKA_CLASS, AttributeValue::Uint(*class as u64)),
        Attribute::KeyType(kind) => (CKA_KEY_TYPE, AttributeValue::Uint(*kind as u64)),
        Attribute::Token(flag) => (CKA_TOKEN, AttributeValue::Bool(flag)),
        Attribute::Private(flag) => (CKA_PRIVATE, AttributeValue::Bool(flag)),
        Attribute::Sensitive(flag) => (CKA_SENSITIVE, AttributeValue::Bool(flag)),
        Attribute::Extractable(flag) => (CKA_EXTRACTABLE, AttributeValue::Bool(flag)),
        Attribute::Encrypt(flag) => (CKA_ENCRYPT, AttributeValue::Bool(flag)),
        Attribute::Decrypt(flag) => (CKA_DECRYPT, AttributeValue::Bool(flag)),
        Attribute::Wrap(flag) => (CKA_WRAP, AttributeValue::Bool(flag)),
        Attribute::Unwrap(flag) => (CKA_UNWRAP, AttributeValue::Bool(flag)),
        Attribute::Sign(flag) => (CKA_SIGN, AttributeValue::Bool(flag)),
        Attribute::Verify(flag) => (CKA_VERIFY, AttributeValue::Bool(flag)),
        Attribute::Label(bytes) => (CKA_LABEL, AttributeValue::Bytes(bytes)),
        Attribute::Id(bytes) => (CKA_ID, AttributeValue::Bytes(bytes)),
        Attribute::Value(bytes) => (CKA_VALUE, AttributeValue::Bytes(bytes)),
        Attribute::Modulus(bytes) => (CKA_MODULUS, AttributeValue::Bytes(bytes)),
        Attribute::PublicExponent(bytes) => (CKA_PUBLIC_EXPONENT, AttributeValue::Bytes(bytes)),
        Attribute::ValueLen(len) => (CKA_VALUE_LEN, AttributeValue::Uint(u64::from(len))),
        Attribute::ModulusBits(bits) => (CKA_MODULUS_BITS, AttributeValue::Uint(u64::from(bits))),
        Attribute::AllowedMechanisms(list) => (
            CKA_ALLOWED_MECHANISMS,
            AttributeValue::Mechanisms(
                list.iter()
                    .filter_map(|mechanism| MechanismType::from_code(**mechanism as u64))
                    .collect(),
            ),
        ),
        _ => return None,
    };
    Some(converted)
}

impl TokenBackend for Pkcs11Backend {
    fn id(&self) -> &'static str {
        "pkcs11"
    }

    fn initialize(&self) -> BackendResult<()> {
        let mut context = self.context.write();
        if context.is_some() {
            return Ok(());
        }
        let module = Pkcs11::new(&self.module_path).map_err(BackendError::module)?;
        match module.initialize(CInitializeArgs::OsThreads) {
            Ok(()) | Err(CkError::Pkcs11(RvError::CryptokiAlreadyInitialized, _)) => {}
            Err(err) => return Err(ck_error("C_Initialize")(err)),
        }
        info!(module = %self.module_path.display(), "PKCS#11 module initialized");
        *context = Some(module);
        Ok(())
    }

    fn finalize(&self) -> BackendResult<()> {
        self.sessions.write().clear();
        // Dropping the last clone of the context issues C_Finalize.
        self.context
            .write()
            .take()
            .map(|_| ())
            .ok_or_else(|| BackendError::rv("C_Finalize", ReturnValue::CryptokiNotInitialized))
    }

    fn mechanisms(&self, slot: SlotId) -> BackendResult<Vec<MechanismType>> {
        let (context, slot) = self.slot("C_GetMechanismList", slot)?;
        let list = context
            .get_mechanism_list(slot)
            .map_err(ck_error("C_GetMechanismList"))?;
        Ok(list
            .iter()
            .filter_map(|mechanism| MechanismType::from_code(**mechanism as u64))
            .collect())
    }

    fn open_session(&self, slot: SlotId) -> BackendResult<SessionHandle> {
        let (context, ck_slot) = self.slot("C_OpenSession", slot)?;
        let session = context
            .open_rw_session(ck_slot)
            .map_err(ck_error("C_OpenSession"))?;
        let handle = self.next_session.fetch_add(1, Ordering::Relaxed);
        let entry = SessionEntry {
            slot,
            session,
            objects: HashMap::new(),
            known: Vec::new(),
            cursor: None,
        };
        self.sessions.write().insert(handle, Arc::new(Mutex::new(entry)));
        Ok(handle)
    }

    fn close_session(&self, session: SessionHandle) -> BackendResult<()> {
        // cryptoki closes the session when the last reference is dropped.
        self.sessions
            .write()
            .remove(&session)
            .map(|_| ())
            .ok_or_else(|| BackendError::rv("C_CloseSession", ReturnValue::SessionHandleInvalid))
    }

    fn close_all_sessions(&self, slot: SlotId) -> BackendResult<()> {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, entry| entry.lock().slot != slot);
        debug!(slot, closed = before - sessions.len(), "closed all sessions on slot");
        Ok(())
    }

    fn login(&self, session: SessionHandle, pin: &SecretString) -> BackendResult<()> {
        self.with_session("C_Login", session, |entry| {
            let pin = AuthPin::new(pin.expose().to_owned());
            entry
                .session
                .login(UserType::User, Some(&pin))
                .map_err(ck_error("C_Login"))
        })
    }

    fn logout(&self, session: SessionHandle) -> BackendResult<()> {
        self.with_session("C_Logout", session, |entry| {
            entry.session.logout().map_err(ck_error("C_Logout"))
        })
    }

    fn find_objects_init(&self, session: SessionHandle, template: &AttributeTemplate) -> BackendResult<()> {
        const F: &str = "C_FindObjectsInit";
        let template = CkTemplate::convert(F, template)?;
        let next = &self.next_object;
        self.with_session(F, session, |entry| {
            if entry.cursor.is_some() {
                return Err(BackendError::rv(F, ReturnValue::OperationActive));
            }
            let found = entry.session.find_objects(&template.0).map_err(ck_error(F))?;
            let ids = found.into_iter().map(|handle| entry.register(next, handle)).collect();
            entry.cursor = Some(ids);
            Ok(())
        })
    }

    fn find_objects(&self, session: SessionHandle, max: usize) -> BackendResult<Vec<ObjectHandle>> {
        self.with_session("C_FindObjects", session, |entry| {
            let cursor = entry
                .cursor
                .as_mut()
                .ok_or_else(|| BackendError::rv("C_FindObjects", ReturnValue::OperationNotInitialized))?;
            let limit = max.max(1).min(cursor.len());
            Ok(cursor.drain(..limit).collect())
        })
    }

    fn find_objects_final(&self, session: SessionHandle) -> BackendResult<()> {
        self.with_session("C_FindObjectsFinal", session, |entry| {
            entry
                .cursor
                .take()
                .map(|_| ())
                .ok_or_else(|| BackendError::rv("C_FindObjectsFinal", ReturnValue::OperationNotInitialized))
        })
    }

    fn create_object(&self, session: SessionHandle, template: &AttributeTemplate) -> BackendResult<ObjectHandle> {
        const F: &str = "C_CreateObject";
        let template = CkTemplate::convert(F, template)?;
        self.with_session(F, session, |entry| {
            let handle = entry.session.create_object(&template.0).map_err(ck_error(F))?;
            Ok(entry.register(&self.next_object, handle))
        })
    }

    fn destroy_object(&self, session: SessionHandle, object: ObjectHandle) -> BackendResult<()> {
        const F: &str = "C_DestroyObject";
        self.with_session(F, session, |entry| {
            let handle = entry.resolve(F, object)?;
            entry.session.destroy_object(handle).map_err(ck_error(F))?;
            entry.forget(object);
            Ok(())
        })
    }

    fn get_attributes(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        attributes: &[AttributeId],
    ) -> BackendResult<AttributeSet> {
        const F: &str = "C_GetAttributeValue";
        let types: Vec<AttributeType> = attributes.iter().filter_map(|id| attribute_type(*id)).collect();
        self.with_session(F, session, |entry| {
            let handle = entry.resolve(F, object)?;
            let values = entry.session.get_attributes(handle, &types).map_err(ck_error(F))?;
            let mut out = AttributeSet::new();
            for (id, value) in values.into_iter().filter_map(from_attribute) {
                out.insert(id, value);
            }
            Ok(out)
        })
    }

    fn generate_key(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        template: &AttributeTemplate,
    ) -> BackendResult<ObjectHandle> {
        const F: &str = "C_GenerateKey";
        let mechanism = to_mechanism(F, mechanism)?;
        let template = CkTemplate::convert(F, template)?;
        self.with_session(F, session, |entry| {
            let handle = entry
                .session
                .generate_key(&mechanism, &template.0)
                .map_err(ck_error(F))?;
            Ok(entry.register(&self.next_object, handle))
        })
    }

    fn generate_key_pair(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        public_template: &AttributeTemplate,
        private_template: &AttributeTemplate,
    ) -> BackendResult<(ObjectHandle, ObjectHandle)> {
        const F: &str = "C_GenerateKeyPair";
        let mechanism = to_mechanism(F, mechanism)?;
        let public_template = CkTemplate::convert(F, public_template)?;
        let private_template = CkTemplate::convert(F, private_template)?;
        self.with_session(F, session, |entry| {
            let (public, private) = entry
                .session
                .generate_key_pair(&mechanism, &public_template.0, &private_template.0)
                .map_err(ck_error(F))?;
            Ok((
                entry.register(&self.next_object, public),
                entry.register(&self.next_object, private),
            ))
        })
    }

    fn encrypt(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> BackendResult<Vec<u8>> {
        const F: &str = "C_Encrypt";
        let mechanism = to_mechanism(F, mechanism)?;
        self.with_session(F, session, |entry| {
            let key = entry.resolve(F, key)?;
            entry.session.encrypt(&mechanism, key, data).map_err(ck_error(F))
        })
    }

    fn decrypt(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> BackendResult<SecretBytes> {
        const F: &str = "C_Decrypt";
        let mechanism = to_mechanism(F, mechanism)?;
        self.with_session(F, session, |entry| {
            let key = entry.resolve(F, key)?;
            entry
                .session
                .decrypt(&mechanism, key, data)
                .map(SecretBytes::new)
                .map_err(ck_error(F))
        })
    }

    fn sign(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> BackendResult<Vec<u8>> {
        const F: &str = "C_Sign";
        let mechanism = to_mechanism(F, mechanism)?;
        self.with_session(F, session, |entry| {
            let key = entry.resolve(F, key)?;
            entry.session.sign(&mechanism, key, data).map_err(ck_error(F))
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
        let mechanism = to_mechanism(F, mechanism)?;
        self.with_session(F, session, |entry| {
            let key = entry.resolve(F, key)?;
            entry
                .session
                .verify(&mechanism, key, data, signature)
                .map_err(ck_error(F))
        })
    }
}
