//! Self-contained [`KeyTool`] for tests and tool-less environments.
//!
//! Key pairs and certificate signatures are real (`rcgen`), so certificates
//! exported from this tool verify like the ones `keytool` produces.
//!
//! The keystore file is the only state. It holds every entry as PEM blocks
//! (PKCS#8 key followed by its chain, or one trusted certificate) under a
//! one-line entry header, plus a digest of the store password. Each call
//! reloads the file, so moving an older file back into place brings back
//! exactly the entries it was written with.

use std::collections::BTreeMap;
use std::fs;
use std::sync::{PoisonError, RwLock};

use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, IsCa, KeyUsagePurpose,
};
use rustls_pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use time::OffsetDateTime;

use crate::error::{KeyError, Result};
use crate::fingerprint::Fingerprint;
use crate::identity::certificate::random_serial;
use crate::identity::{Certificate, KeyAlgorithm};
use crate::keytool::{KeyPairSpec, KeyTool, Keystore};

/// First line of every keystore file this tool writes.
const MAGIC: &str = "memory-keystore v1";

enum Entry {
    KeyPair {
        algorithm: KeyAlgorithm,
        pkcs8: Vec<u8>,
        /// Leaf first.
        chain: Vec<Certificate>,
    },
    Trusted(Certificate),
}

impl Entry {
    fn certificate(&self) -> &Certificate {
        match self {
            Self::KeyPair { chain, .. } => &chain[0],
            Self::Trusted(cert) => cert,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::KeyPair { .. } => "PrivateKeyEntry",
            Self::Trusted(_) => "trustedCertEntry",
        }
    }
}

struct Store {
    password_digest: String,
    entries: BTreeMap<String, Entry>,
}

impl Store {
    fn empty(password: &str) -> Self {
        Self {
            password_digest: password_digest(password),
            entries: BTreeMap::new(),
        }
    }
}

/// [`KeyTool`] that needs no external binary.
pub struct MemoryKeyTool {
    /// Serializes read-modify-write cycles on keystore files.
    lock: RwLock<()>,
    clock: fn() -> i64,
}

impl Default for MemoryKeyTool {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKeyTool {
    pub fn new() -> Self {
        Self::with_clock(|| OffsetDateTime::now_utc().unix_timestamp())
    }

    /// Use a fixed clock (seconds since Unix epoch) for certificate validity.
    pub fn with_clock(clock: fn() -> i64) -> Self {
        Self {
            lock: RwLock::new(()),
            clock,
        }
    }

    /// Run `f` against the store at `keystore`, creating it when `create`
    /// is set, and write the store back afterwards.
    fn modify<T>(
        &self,
        operation: &'static str,
        keystore: &Keystore,
        create: bool,
        f: impl FnOnce(&mut Store, i64) -> std::result::Result<T, String>,
    ) -> Result<T> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        let mut store = match load(operation, keystore)? {
            Some(store) => store,
            None if create => Store::empty(keystore.password()),
            None => return Err(tool_error(operation, "keystore file does not exist")),
        };

        let out = f(&mut store, (self.clock)())
            .map_err(|message| KeyError::KeyTool { operation, message })?;
        persist(keystore, &store)?;
        Ok(out)
    }

    fn read<T>(
        &self,
        operation: &'static str,
        keystore: &Keystore,
        f: impl FnOnce(&Store) -> std::result::Result<T, String>,
    ) -> Result<T> {
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);
        let store = load(operation, keystore)?
            .ok_or_else(|| tool_error(operation, "keystore file does not exist"))?;
        f(&store).map_err(|message| KeyError::KeyTool { operation, message })
    }
}

impl KeyTool for MemoryKeyTool {
    fn generate_key_pair(&self, keystore: &Keystore, spec: &KeyPairSpec<'_>) -> Result<()> {
        self.modify("generate key pair", keystore, true, |store, now| {
            if store.entries.contains_key(spec.alias) {
                return Err(format!(
                    "Key pair not generated, alias <{}> already exists",
                    spec.alias
                ));
            }

            let key_pair =
                rcgen::KeyPair::generate_for(spec.algorithm.rcgen()).map_err(|e| e.to_string())?;
            let mut params = base_params(spec.common_name, now, spec.validity_days)?;
            // A self-signed entry may later act as an issuer for gencert.
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.key_usages = vec![
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::KeyCertSign,
            ];
            let cert = params.self_signed(&key_pair).map_err(|e| e.to_string())?;
            let cert = Certificate::from_der(cert.der()).map_err(|e| e.to_string())?;

            store.entries.insert(
                spec.alias.to_string(),
                Entry::KeyPair {
                    algorithm: spec.algorithm,
                    pkcs8: key_pair.serialize_der(),
                    chain: vec![cert],
                },
            );
            Ok(())
        })
    }

    fn cert_request(&self, keystore: &Keystore, alias: &str) -> Result<Vec<u8>> {
        self.read("certificate request", keystore, |store| {
            let (algorithm, pkcs8, chain) = key_pair_entry(store, alias)?;
            let key_pair = rebuild_key_pair(algorithm, pkcs8)?;

            let mut params =
                CertificateParams::new(Vec::<String>::new()).map_err(|e| e.to_string())?;
            params.distinguished_name = subject_of(&chain[0])?;
            let csr = params.serialize_request(&key_pair).map_err(|e| e.to_string())?;
            csr.pem().map(String::into_bytes).map_err(|e| e.to_string())
        })
    }

    fn sign_cert(
        &self,
        keystore: &Keystore,
        issuer_alias: &str,
        csr: &[u8],
        validity_days: i64,
    ) -> Result<Vec<u8>> {
        let now = (self.clock)();
        self.read("sign certificate", keystore, |store| {
            let (algorithm, pkcs8, chain) = key_pair_entry(store, issuer_alias)?;
            let issuer_key = rebuild_key_pair(algorithm, pkcs8)?;
            let issuer_der = CertificateDer::from(chain[0].der().to_vec());
            let issuer = CertificateParams::from_ca_cert_der(&issuer_der)
                .and_then(|params| params.self_signed(&issuer_key))
                .map_err(|e| e.to_string())?;

            let csr_pem = std::str::from_utf8(csr).map_err(|e| format!("request is not PEM: {e}"))?;
            let mut request =
                CertificateSigningRequestParams::from_pem(csr_pem).map_err(|e| e.to_string())?;
            let window = base_params("unused", now, validity_days)?;
            request.params.not_before = window.not_before;
            request.params.not_after = window.not_after;
            request.params.serial_number = window.serial_number;
            request.params.is_ca = IsCa::ExplicitNoCa;

            let cert = request
                .signed_by(&issuer, &issuer_key)
                .map_err(|e| e.to_string())?;
            Ok(cert.pem().into_bytes())
        })
    }

    fn import_cert(&self, keystore: &Keystore, alias: &str, cert: &[u8]) -> Result<()> {
        self.modify("import certificate", keystore, true, |store, _| {
            let mut certs = parse_certificates(cert)?;
            if certs.is_empty() {
                return Err("Input not an X.509 certificate".into());
            }
            let leaf = certs.remove(0);

            // Issuer chain from an existing entry whose subject matches.
            let issuer_chain: Vec<Certificate> = store
                .entries
                .iter()
                .filter(|(name, _)| name.as_str() != alias)
                .map(|(_, entry)| entry)
                .find(|entry| entry.certificate().subject() == leaf.issuer() && !leaf.is_self_issued())
                .map(|entry| match entry {
                    Entry::KeyPair { chain, .. } => chain.clone(),
                    Entry::Trusted(c) => vec![c.clone()],
                })
                .unwrap_or(certs);

            match store.entries.get_mut(alias) {
                Some(Entry::KeyPair { pkcs8, algorithm, chain }) => {
                    let key_pair = rebuild_key_pair(*algorithm, pkcs8)?;
                    let reply_key =
                        crate::verify::public_key_bytes(leaf.der()).map_err(|e| e.to_string())?;
                    if reply_key != key_pair.public_key_raw() {
                        return Err("Public keys in reply and keystore don't match".into());
                    }
                    *chain = std::iter::once(leaf).chain(issuer_chain).collect();
                    Ok(())
                }
                Some(Entry::Trusted(_)) => Err(format!(
                    "Certificate not imported, alias <{alias}> already exists"
                )),
                None => {
                    store.entries.insert(alias.to_string(), Entry::Trusted(leaf));
                    Ok(())
                }
            }
        })
    }

    fn export_cert(&self, keystore: &Keystore, alias: &str) -> Result<Vec<u8>> {
        self.read("export certificate", keystore, |store| {
            store
                .entries
                .get(alias)
                .map(|entry| entry.certificate().pem().as_bytes().to_vec())
                .ok_or_else(|| format!("Alias <{alias}> does not exist"))
        })
    }

    fn delete_entry(&self, keystore: &Keystore, alias: &str) -> Result<()> {
        self.modify("delete entry", keystore, false, |store, _| {
            store
                .entries
                .remove(alias)
                .map(|_| ())
                .ok_or_else(|| format!("Alias <{alias}> does not exist"))
        })
    }

    fn list_aliases(&self, keystore: &Keystore) -> Result<Vec<String>> {
        if !keystore.exists() {
            return Ok(Vec::new());
        }
        self.read("list entries", keystore, |store| {
            Ok(store.entries.keys().cloned().collect())
        })
    }
}

fn tool_error(operation: &'static str, message: &str) -> KeyError {
    KeyError::KeyTool {
        operation,
        message: message.to_string(),
    }
}

fn key_pair_entry<'a>(
    store: &'a Store,
    alias: &str,
) -> std::result::Result<(KeyAlgorithm, &'a [u8], &'a [Certificate]), String> {
    match store.entries.get(alias) {
        Some(Entry::KeyPair {
            algorithm,
            pkcs8,
            chain,
        }) => Ok((*algorithm, pkcs8.as_slice(), chain.as_slice())),
        Some(Entry::Trusted(_)) => Err(format!("Alias <{alias}> has no private key")),
        None => Err(format!("Alias <{alias}> does not exist")),
    }
}

fn rebuild_key_pair(
    algorithm: KeyAlgorithm,
    pkcs8: &[u8],
) -> std::result::Result<rcgen::KeyPair, String> {
    let der = PrivatePkcs8KeyDer::from(pkcs8.to_vec());
    rcgen::KeyPair::from_pkcs8_der_and_sign_algo(&der, algorithm.rcgen()).map_err(|e| e.to_string())
}

fn base_params(
    common_name: &str,
    now: i64,
    validity_days: i64,
) -> std::result::Result<CertificateParams, String> {
    let mut params = CertificateParams::new(Vec::<String>::new()).map_err(|e| e.to_string())?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    params.not_before = OffsetDateTime::from_unix_timestamp(now).map_err(|e| e.to_string())?;
    params.not_after = OffsetDateTime::from_unix_timestamp(now + validity_days * 86400)
        .map_err(|e| e.to_string())?;
    params.serial_number = Some(random_serial());
    Ok(params)
}

fn subject_of(cert: &Certificate) -> std::result::Result<DistinguishedName, String> {
    let der = CertificateDer::from(cert.der().to_vec());
    CertificateParams::from_ca_cert_der(&der)
        .map(|params| params.distinguished_name)
        .map_err(|e| e.to_string())
}

fn parse_certificates(input: &[u8]) -> std::result::Result<Vec<Certificate>, String> {
    let text = std::str::from_utf8(input).map_err(|e| format!("input is not PEM: {e}"))?;
    pem::parse_many(text)
        .map_err(|e| e.to_string())?
        .into_iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .map(|block| Certificate::from_der(block.contents()).map_err(|e| e.to_string()))
        .collect()
}

fn password_digest(password: &str) -> String {
    Fingerprint::of_bytes(password.as_bytes()).to_string()
}

fn algorithm_name(algorithm: KeyAlgorithm) -> &'static str {
    match algorithm {
        KeyAlgorithm::EcdsaP384 => "ecdsa-p384",
        KeyAlgorithm::EcdsaP256 => "ecdsa-p256",
    }
}

fn algorithm_from_name(name: &str) -> std::result::Result<KeyAlgorithm, String> {
    match name {
        "ecdsa-p384" => Ok(KeyAlgorithm::EcdsaP384),
        "ecdsa-p256" => Ok(KeyAlgorithm::EcdsaP256),
        other => Err(format!("unknown key algorithm '{other}'")),
    }
}

/// Read and decode the store at `keystore`. `None` if the file is absent.
fn load(operation: &'static str, keystore: &Keystore) -> Result<Option<Store>> {
    if !keystore.exists() {
        return Ok(None);
    }
    let path = keystore.path();
    let text = fs::read_to_string(path).map_err(|e| KeyError::io(path, e))?;
    let store = decode(&text).map_err(|message| KeyError::KeyTool { operation, message })?;
    if store.password_digest != password_digest(keystore.password()) {
        return Err(tool_error(operation, "keystore password was incorrect"));
    }
    Ok(Some(store))
}

fn persist(keystore: &Keystore, store: &Store) -> Result<()> {
    let path = keystore.path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| KeyError::io(parent, e))?;
    }
    fs::write(path, encode(store)).map_err(|e| KeyError::io(path, e))
}

fn encode(store: &Store) -> String {
    let mut out = format!("{MAGIC}\nstorepass-sha256 {}\n", store.password_digest);
    for (alias, entry) in &store.entries {
        match entry {
            Entry::KeyPair {
                algorithm,
                pkcs8,
                chain,
            } => {
                out.push_str(&format!(
                    "entry {alias} {} {}\n",
                    entry.kind(),
                    algorithm_name(*algorithm)
                ));
                push_block(&mut out, &pem::encode(&pem::Pem::new("PRIVATE KEY", pkcs8.clone())));
                for cert in chain {
                    push_block(&mut out, cert.pem());
                }
            }
            Entry::Trusted(cert) => {
                out.push_str(&format!("entry {alias} {}\n", entry.kind()));
                push_block(&mut out, cert.pem());
            }
        }
    }
    out
}

fn push_block(out: &mut String, block: &str) {
    out.push_str(block);
    if !out.ends_with('\n') {
        out.push('\n');
    }
}

fn decode(text: &str) -> std::result::Result<Store, String> {
    let mut lines = text.lines();
    if lines.next() != Some(MAGIC) {
        return Err("not a keystore file written by this tool".into());
    }
    let password_digest = lines
        .next()
        .and_then(|line| line.strip_prefix("storepass-sha256 "))
        .ok_or("keystore header has no password digest")?
        .to_string();

    let mut sections: Vec<(&str, String)> = Vec::new();
    for line in lines {
        if let Some(header) = line.strip_prefix("entry ") {
            sections.push((header, String::new()));
        } else if let Some((_, body)) = sections.last_mut() {
            body.push_str(line);
            body.push('\n');
        } else if !line.trim().is_empty() {
            return Err(format!("unexpected line before first entry: '{line}'"));
        }
    }

    let mut entries = BTreeMap::new();
    for (header, body) in sections {
        let blocks = pem::parse_many(&body).map_err(|e| e.to_string())?;
        let fields: Vec<&str> = header.split_whitespace().collect();
        let (alias, entry) = match fields.as_slice() {
            [alias, "PrivateKeyEntry", algorithm] => {
                let algorithm = algorithm_from_name(algorithm)?;
                let (key, certs) = blocks
                    .split_first()
                    .filter(|(key, _)| key.tag() == "PRIVATE KEY")
                    .ok_or_else(|| format!("entry <{alias}> has no private key"))?;
                let chain = certs
                    .iter()
                    .map(|block| Certificate::from_der(block.contents()).map_err(|e| e.to_string()))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                if chain.is_empty() {
                    return Err(format!("entry <{alias}> has no certificate chain"));
                }
                let entry = Entry::KeyPair {
                    algorithm,
                    pkcs8: key.contents().to_vec(),
                    chain,
                };
                (*alias, entry)
            }
            [alias, "trustedCertEntry"] => {
                let block = blocks
                    .first()
                    .ok_or_else(|| format!("entry <{alias}> has no certificate"))?;
                let cert = Certificate::from_der(block.contents()).map_err(|e| e.to_string())?;
                (*alias, Entry::Trusted(cert))
            }
            _ => return Err(format!("malformed entry header '{header}'")),
        };
        entries.insert(alias.to_string(), entry);
    }

    Ok(Store {
        password_digest,
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify;

    const JAN_1_2025: i64 = 1735689600;

    fn spec<'a>(alias: &'a str, cn: &'a str) -> KeyPairSpec<'a> {
        KeyPairSpec {
            alias,
            common_name: cn,
            algorithm: KeyAlgorithm::EcdsaP384,
            validity_days: 36500,
        }
    }

    fn export(tool: &MemoryKeyTool, ks: &Keystore, alias: &str) -> Certificate {
        let pem_bytes = tool.export_cert(ks, alias).unwrap();
        parse_certificates(&pem_bytes).unwrap().remove(0)
    }

    #[test]
    fn signed_request_chains_to_issuer() {
        let dir = tempfile::tempdir().unwrap();
        let tool = MemoryKeyTool::with_clock(|| JAN_1_2025);
        let ks = Keystore::new(dir.path().join("private-node0.pfx"), "password");

        tool.generate_key_pair(&ks, &spec("s-private-node0", "s-node0")).unwrap();
        tool.generate_key_pair(&ks, &spec("a-private-node0", "a-node0")).unwrap();
        let csr = tool.cert_request(&ks, "a-private-node0").unwrap();
        let signed = tool.sign_cert(&ks, "s-private-node0", &csr, 36500).unwrap();
        tool.import_cert(&ks, "a-private-node0", &signed).unwrap();

        let signing = export(&tool, &ks, "s-private-node0");
        let agreement = export(&tool, &ks, "a-private-node0");
        assert_eq!(agreement.subject(), "CN=a-node0");
        assert_eq!(agreement.issuer(), signing.subject());
        assert!(verify::verify_issued_by(&agreement, &signing).is_ok());
        assert!(ks.exists());
    }

    #[test]
    fn reply_for_wrong_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tool = MemoryKeyTool::new();
        let ks = Keystore::new(dir.path().join("k.pfx"), "password");

        tool.generate_key_pair(&ks, &spec("s", "s")).unwrap();
        tool.generate_key_pair(&ks, &spec("a", "a")).unwrap();
        tool.generate_key_pair(&ks, &spec("b", "b")).unwrap();
        let csr = tool.cert_request(&ks, "b").unwrap();
        let signed = tool.sign_cert(&ks, "s", &csr, 10).unwrap();

        let err = tool.import_cert(&ks, "a", &signed).unwrap_err();
        assert!(matches!(err, KeyError::KeyTool { .. }));
    }

    #[test]
    fn trusted_alias_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let tool = MemoryKeyTool::new();
        let private = Keystore::new(dir.path().join("private.pfx"), "password");
        let public = Keystore::new(dir.path().join("public.pfx"), "password");

        tool.generate_key_pair(&private, &spec("s-private-node0", "s-node0")).unwrap();
        let cert = tool.export_cert(&private, "s-private-node0").unwrap();

        tool.import_cert(&public, "s-public-node0", &cert).unwrap();
        assert!(tool.import_cert(&public, "s-public-node0", &cert).is_err());

        tool.delete_entry(&public, "s-public-node0").unwrap();
        tool.import_cert(&public, "s-public-node0", &cert).unwrap();
        assert_eq!(tool.list_aliases(&public).unwrap(), vec!["s-public-node0"]);
    }

    #[test]
    fn wrong_password_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tool = MemoryKeyTool::new();
        let ks = Keystore::new(dir.path().join("k.pfx"), "password");
        tool.generate_key_pair(&ks, &spec("s", "s")).unwrap();

        let wrong = Keystore::new(dir.path().join("k.pfx"), "other");
        assert!(tool.export_cert(&wrong, "s").is_err());
    }

    #[test]
    fn restored_file_brings_back_its_entries() {
        let dir = tempfile::tempdir().unwrap();
        let tool = MemoryKeyTool::new();
        let ks = Keystore::new(dir.path().join("private-node1.pfx"), "password");
        tool.generate_key_pair(&ks, &spec("s-private-node1", "s-node1")).unwrap();
        let original = export(&tool, &ks, "s-private-node1");

        let saved = dir.path().join("saved.pfx");
        fs::rename(ks.path(), &saved).unwrap();
        tool.generate_key_pair(&ks, &spec("s-private-node1", "s-node1")).unwrap();
        let rotated = export(&tool, &ks, "s-private-node1");
        assert_ne!(rotated.der(), original.der());

        fs::rename(&saved, ks.path()).unwrap();
        assert_eq!(export(&tool, &ks, "s-private-node1").der(), original.der());
    }

    #[test]
    fn keystore_file_is_the_only_state() {
        let dir = tempfile::tempdir().unwrap();
        let ks = Keystore::new(dir.path().join("private-node0.pfx"), "password");

        let writer = MemoryKeyTool::with_clock(|| JAN_1_2025);
        writer.generate_key_pair(&ks, &spec("s-private-node0", "s-node0")).unwrap();
        writer.generate_key_pair(&ks, &spec("a-private-node0", "a-node0")).unwrap();
        let signing = export(&writer, &ks, "s-private-node0");

        // A second tool signs with the key it reads back from the file.
        let reader = MemoryKeyTool::with_clock(|| JAN_1_2025);
        let csr = reader.cert_request(&ks, "a-private-node0").unwrap();
        let signed = reader.sign_cert(&ks, "s-private-node0", &csr, 36500).unwrap();
        reader.import_cert(&ks, "a-private-node0", &signed).unwrap();

        let agreement = export(&writer, &ks, "a-private-node0");
        assert!(verify::verify_issued_by(&agreement, &signing).is_ok());
        assert_eq!(
            reader.list_aliases(&ks).unwrap(),
            vec!["a-private-node0", "s-private-node0"]
        );
    }

    #[test]
    fn foreign_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tool = MemoryKeyTool::new();
        let ks = Keystore::new(dir.path().join("k.pfx"), "password");
        fs::write(ks.path(), "not a keystore\n").unwrap();

        let err = tool.list_aliases(&ks).unwrap_err();
        assert!(matches!(err, KeyError::KeyTool { .. }));
    }

    #[test]
    fn removed_file_drops_entries() {
        let dir = tempfile::tempdir().unwrap();
        let tool = MemoryKeyTool::new();
        let ks = Keystore::new(dir.path().join("k.pfx"), "password");
        tool.generate_key_pair(&ks, &spec("s", "s")).unwrap();

        fs::remove_file(ks.path()).unwrap();
        assert!(tool.list_aliases(&ks).unwrap().is_empty());
        tool.generate_key_pair(&ks, &spec("s", "s")).unwrap();
        assert_eq!(tool.list_aliases(&ks).unwrap(), vec!["s"]);
    }
}
