use crate::crypto;
use crate::document;
use crate::error::{Error, Result};
use crate::logging;
use crate::Uid;
use serde_derive::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

pub const PUBKEY_LEN: usize = 32;
pub const PRIVKEY_LEN: usize = 64;
pub const SIGNATURE_LEN: usize = 64;
/// Maximum length of an identity alias, in bytes.
pub const ALIAS_MAX_LEN: usize = 48;
pub const MAX_TRANSPORTS: usize = 4;
pub const TRANSPORT_MAX_LEN: usize = 64;
/// Maximum size of the opaque meta and permissions blobs.
pub const BLOB_MAX_LEN: usize = 1024;
/// Default capacity of the identity database.
pub const MAX_IDENTITIES: usize = 2048;

const DB_FILE: &str = "wisp_id_db.bin";
const DB_TMP_FILE: &str = "wisp_id_db.bin.tmp";

/// An identity database entry. The record is *local* when the private key is
/// present, otherwise it is a contact.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Identity {
    pub uid: Uid,
    pub pubkey: [u8; PUBKEY_LEN],
    /// 64-byte Ed25519 private key, present only for local identities.
    pub privkey: Option<Vec<u8>>,
    pub alias: String,
    pub transports: Vec<String>,
    /// Free-form JSON blob, passed through opaquely except for `connect`.
    pub meta: Option<Vec<u8>>,
    /// Free-form JSON blob, passed through opaquely except for `banned`.
    pub permissions: Option<Vec<u8>>,
}

impl Identity {
    #[inline]
    pub fn is_local(&self) -> bool {
        self.privkey.is_some()
    }

    /// False when the contact carries `meta: { connect: false }`. A missing
    /// flag means the contact may be dialed.
    pub fn meta_connect(&self) -> bool {
        json_flag(self.meta.as_ref(), "connect").unwrap_or(true)
    }

    /// True when the contact carries `permissions: { banned: true }`.
    pub fn is_banned(&self) -> bool {
        json_flag(self.permissions.as_ref(), "banned").unwrap_or(false)
    }

    /// Checks the field bounds of an identity before it is persisted.
    fn validate(&self) -> Result<()> {
        if self.alias.len() > ALIAS_MAX_LEN {
            return Err(Error::Serialization);
        }

        if self.transports.len() > MAX_TRANSPORTS
            || self.transports.iter().any(|url| url.len() > TRANSPORT_MAX_LEN)
        {
            return Err(Error::Serialization);
        }

        if let Some(privkey) = &self.privkey {
            if privkey.len() != PRIVKEY_LEN {
                return Err(Error::Serialization);
            }
        }

        let blob_len = |blob: &Option<Vec<u8>>| blob.as_ref().map_or(0, |data| data.len());
        if blob_len(&self.meta) > BLOB_MAX_LEN || blob_len(&self.permissions) > BLOB_MAX_LEN {
            return Err(Error::DocumentTooLarge);
        }

        Ok(())
    }
}

#[inline]
fn json_flag(blob: Option<&Vec<u8>>, key: &str) -> Option<bool> {
    let value: serde_json::Value = serde_json::from_slice(blob?).ok()?;
    value.get(key)?.as_bool()
}

/// The UID of an identity is the SHA-256 digest of its public key.
#[inline]
pub fn pubkey_to_uid(pubkey: &[u8; PUBKEY_LEN]) -> Uid {
    crypto::sha256(pubkey)
}

/// The public part of an exported identity, as signed in certificates.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CertData {
    pub alias: String,
    pub uid: Uid,
    pub pubkey: [u8; PUBKEY_LEN],
    pub transports: Vec<String>,
}

/// An exported identity: the cert-data document plus optional signed meta.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct Export {
    pub data: Vec<u8>,
    pub meta: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CertSignature {
    pub uid: Uid,
    pub sign: Vec<u8>,
}

/// A signed identity certificate, offered in friend requests and remote
/// identity queries. Each signature covers the `data` document.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SignedCert {
    pub data: Vec<u8>,
    pub meta: Vec<u8>,
    pub signatures: Vec<CertSignature>,
}

/// Verifies a signed certificate and populates a contact from it. The uid is
/// recomputed from the public key, never taken on trust.
pub fn identity_from_cert(cert: &SignedCert) -> Result<Identity> {
    let data: CertData = document::decode(&cert.data)?;

    if pubkey_to_uid(&data.pubkey) != data.uid {
        return Err(Error::AuthFailed);
    }

    let signature = cert
        .signatures
        .iter()
        .find(|sig| sig.uid == data.uid)
        .ok_or(Error::AuthFailed)?;

    let hash = claim_hash(&cert.data, None);
    if !crypto::verify(&signature.sign, &hash, &data.pubkey) {
        return Err(Error::AuthFailed);
    }

    let mut transports = data.transports;
    transports.truncate(MAX_TRANSPORTS);

    Ok(Identity {
        uid: data.uid,
        pubkey: data.pubkey,
        privkey: None,
        alias: data.alias,
        transports,
        meta: None,
        permissions: None,
    })
}

/// The hash signed by identities: SHA-256 of the data, XOR'd with the
/// SHA-256 of the claim when one is present. The construction must be
/// reproduced bit-exactly for signatures to round-trip between nodes.
fn claim_hash(data: &[u8], claim: Option<&[u8]>) -> [u8; crypto::HASH_SIZE] {
    let mut hash = crypto::sha256(data);

    if let Some(claim) = claim {
        if !claim.is_empty() {
            let claim_hash = crypto::sha256(claim);
            for (byte, claim_byte) in hash.iter_mut().zip(claim_hash.iter()) {
                *byte ^= claim_byte;
            }
        }
    }

    hash
}

/// Append-only identity record store. Every record is a self-delimiting
/// document; updates rewrite the whole file under a temporary name and
/// atomically rename it over the original.
pub struct IdentityStore {
    path: PathBuf,
    tmp_path: PathBuf,
    max_entries: usize,
    log: logging::Logger,
}

impl IdentityStore {
    pub fn open(directory: &Path, log: &logging::Logger) -> IdentityStore {
        IdentityStore {
            path: directory.join(DB_FILE),
            tmp_path: directory.join(DB_TMP_FILE),
            max_entries: MAX_IDENTITIES,
            log: log.new(logging::o!("module" => "identity")),
        }
    }

    /// Reads all raw records. Read errors surface as an empty tail: callers
    /// observe "not found" and re-seek on the next pass.
    fn read_records(&self) -> Vec<Vec<u8>> {
        let mut records = Vec::new();

        let mut file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(_) => return records,
        };

        while records.len() < self.max_entries {
            let mut head = [0u8; document::HEADER_SIZE];
            match file.read_exact(&mut head) {
                Ok(()) => (),
                Err(ref err) if err.kind() == ErrorKind::UnexpectedEof => break,
                Err(err) => {
                    logging::warn!(self.log, "identity db read failed"; "error" => %err);
                    break;
                }
            }

            let total = match document::declared_len(&head) {
                Ok(total) => total,
                Err(_) => {
                    logging::warn!(self.log, "identity db record has a bad length");
                    break;
                }
            };

            let mut record = vec![0u8; total];
            record[..document::HEADER_SIZE].copy_from_slice(&head);
            if file.read_exact(&mut record[document::HEADER_SIZE..]).is_err() {
                logging::warn!(self.log, "identity db record truncated");
                break;
            }

            records.push(record);
        }

        records
    }

    /// Lists the UIDs present in the database, bounded by the store capacity.
    pub fn uids(&self) -> Vec<Uid> {
        self.read_records()
            .iter()
            .filter_map(|record| document::decode::<Identity>(record).ok())
            .map(|identity| identity.uid)
            .collect()
    }

    /// Lists the UIDs usable for opening connections (private key present).
    pub fn local_uids(&self) -> Vec<Uid> {
        self.read_records()
            .iter()
            .filter_map(|record| document::decode::<Identity>(record).ok())
            .filter(Identity::is_local)
            .map(|identity| identity.uid)
            .collect()
    }

    pub fn load(&self, uid: &Uid) -> Result<Identity> {
        self.read_records()
            .iter()
            .filter_map(|record| document::decode::<Identity>(record).ok())
            .find(|identity| identity.uid == *uid)
            .ok_or(Error::NotFound)
    }

    pub fn exists(&self, uid: &Uid) -> bool {
        self.load(uid).is_ok()
    }

    pub fn has_privkey(&self, uid: &Uid) -> bool {
        self.load(uid).map_or(false, |identity| identity.is_local())
    }

    pub fn load_pubkey(&self, uid: &Uid) -> Result<[u8; PUBKEY_LEN]> {
        self.load(uid).map(|identity| identity.pubkey)
    }

    /// Appends a new record. Fails when the database is at capacity.
    pub fn save(&self, identity: &Identity) -> Result<()> {
        identity.validate()?;

        if self.read_records().len() >= self.max_entries {
            logging::warn!(self.log, "identity db full"; "max" => self.max_entries);
            return Err(Error::StoreFull);
        }

        let record = document::encode(identity)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&record)?;

        logging::debug!(self.log, "identity saved";
                        "alias" => &identity.alias,
                        "local" => identity.is_local());
        Ok(())
    }

    /// Rewrites the database substituting the record with a matching uid.
    /// Returns false when no record matched.
    pub fn update(&self, identity: &Identity) -> Result<bool> {
        identity.validate()?;
        let replacement = document::encode(identity)?;

        self.rewrite(|record| {
            match document::decode::<Identity>(record) {
                Ok(existing) if existing.uid == identity.uid => Some(replacement.clone()),
                _ => None,
            }
        })
    }

    /// Rewrites the database omitting the record with a matching uid.
    /// The caller is responsible for closing connections that reference the
    /// identity. Returns false when no record matched.
    pub fn remove(&self, uid: &Uid) -> Result<bool> {
        let mut matched = false;
        let records = self.read_records();

        let mut tmp = fs::File::create(&self.tmp_path)?;
        for record in &records {
            let is_target = document::decode::<Identity>(record)
                .map_or(false, |identity| identity.uid == *uid);
            if is_target {
                matched = true;
            } else {
                tmp.write_all(record)?;
            }
        }
        tmp.sync_all()?;

        fs::rename(&self.tmp_path, &self.path)?;

        logging::debug!(self.log, "identity removed"; "matched" => matched);
        Ok(matched)
    }

    /// Rewrite pass: each record is either kept verbatim or substituted by
    /// the closure. The temporary file replaces the database atomically; if
    /// the rename fails the old file remains intact.
    fn rewrite<F: FnMut(&[u8]) -> Option<Vec<u8>>>(&self, mut substitute: F) -> Result<bool> {
        let mut matched = false;
        let records = self.read_records();

        let mut tmp = fs::File::create(&self.tmp_path)?;
        for record in &records {
            match substitute(record) {
                Some(replacement) => {
                    matched = true;
                    tmp.write_all(&replacement)?;
                }
                None => tmp.write_all(record)?,
            }
        }
        tmp.sync_all()?;

        fs::rename(&self.tmp_path, &self.path)?;
        Ok(matched)
    }

    /// Generates a keypair and persists a new local identity. The transports
    /// are the node's configured relay hosts rendered as transport URLs.
    pub fn create_local(&self, alias: &str, transports: &[String]) -> Result<Identity> {
        let mut seed = [0u8; crypto::SIGN_SEED_SIZE];
        crypto::random_bytes(&mut seed);
        let (pubkey, privkey) = crypto::sign_keypair(&seed);

        let identity = Identity {
            uid: pubkey_to_uid(&pubkey),
            pubkey,
            privkey: Some(privkey.to_vec()),
            alias: alias.to_string(),
            transports: transports
                .iter()
                .take(MAX_TRANSPORTS)
                .cloned()
                .collect(),
            meta: None,
            permissions: None,
        };

        self.save(&identity)?;
        logging::info!(self.log, "local identity created"; "alias" => alias);
        Ok(identity)
    }

    /// Signs `data` with the identity's private key. When a claim is given
    /// the signature covers it through the hash construction.
    pub fn sign(&self, uid: &Uid, data: &[u8], claim: Option<&[u8]>) -> Result<[u8; SIGNATURE_LEN]> {
        if data.is_empty() {
            return Err(Error::Serialization);
        }

        let identity = self.load(uid)?;
        let privkey = identity.privkey.ok_or(Error::NoPrivateKey)?;

        let mut key = [0u8; PRIVKEY_LEN];
        key.copy_from_slice(&privkey);

        Ok(crypto::sign(&claim_hash(data, claim), &key))
    }

    /// Verifies a signature produced by `sign`. A failed verification is a
    /// `false` return, not an error.
    pub fn verify(
        &self,
        uid: &Uid,
        data: &[u8],
        claim: Option<&[u8]>,
        signature: &[u8],
    ) -> Result<bool> {
        if data.is_empty() {
            return Err(Error::Serialization);
        }

        let identity = self.load(uid)?;
        Ok(crypto::verify(
            signature,
            &claim_hash(data, claim),
            &identity.pubkey,
        ))
    }

    /// Produces the export form of an identity: the record minus the private
    /// key, plus optional signed meta.
    pub fn export(&self, identity: &Identity, signed_meta: Option<&[u8]>) -> Result<Export> {
        let data = CertData {
            alias: identity.alias.clone(),
            uid: identity.uid,
            pubkey: identity.pubkey,
            transports: identity.transports.clone(),
        };

        Ok(Export {
            data: document::encode(&data)?,
            meta: signed_meta.map_or_else(Vec::new, <[u8]>::to_vec),
        })
    }

    /// Builds a certificate for a local identity, self-signed over its
    /// export data.
    pub fn build_signed_cert(&self, luid: &Uid, meta: Option<&[u8]>) -> Result<SignedCert> {
        if let Some(meta) = meta {
            if meta.len() > BLOB_MAX_LEN {
                return Err(Error::DocumentTooLarge);
            }
        }

        let identity = self.load(luid)?;
        let export = self.export(&identity, meta)?;
        let signature = self.sign(luid, &export.data, None)?;

        Ok(SignedCert {
            data: export.data,
            meta: export.meta,
            signatures: vec![CertSignature {
                uid: *luid,
                sign: signature.to_vec(),
            }],
        })
    }

    /// Sets or clears `meta: { connect: <bool> }` on a stored contact.
    pub fn set_meta_connect(&self, uid: &Uid, status: Option<bool>) -> Result<()> {
        let mut identity = self.load(uid)?;

        let mut value: serde_json::Value = identity
            .meta
            .as_ref()
            .and_then(|blob| serde_json::from_slice(blob).ok())
            .unwrap_or_else(|| serde_json::json!({}));

        match status {
            Some(flag) => {
                value["connect"] = serde_json::Value::Bool(flag);
            }
            None => {
                if let Some(map) = value.as_object_mut() {
                    map.remove("connect");
                }
            }
        }

        identity.meta = if value.as_object().map_or(true, |map| map.is_empty()) {
            None
        } else {
            Some(serde_json::to_vec(&value).map_err(|_| Error::Serialization)?)
        };

        self.update(&identity)?;
        Ok(())
    }
}
