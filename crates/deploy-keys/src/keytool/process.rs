//! [`KeyTool`] backed by the JDK `keytool` binary.
//!
//! Each operation is one `keytool` invocation against a PKCS#12 store.
//! Requests and certificates are passed through stdin/stdout in RFC 7468
//! (PEM) form. A non-zero exit status is returned as
//! [`KeyError::KeyTool`] carrying the tool's stderr.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::{KeyError, Result};
use crate::keytool::{KeyPairSpec, KeyTool, Keystore};

/// Environment variable carrying the store password to `keytool`.
const STOREPASS_ENV: &str = "DEPLOY_KEYSTORE_PASS";

/// Runs `keytool` as a child process.
#[derive(Debug, Clone)]
pub struct ProcessKeyTool {
    program: PathBuf,
}

impl Default for ProcessKeyTool {
    fn default() -> Self {
        Self::new("keytool")
    }
}

impl ProcessKeyTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// `keytool` invocation against `keystore`. The store password is
    /// handed over through the environment so it never shows up in the
    /// process list.
    fn command(&self, keystore: &Keystore, args: &[String]) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(args)
            .arg("-keystore")
            .arg(keystore.path())
            .args(["-storetype", "pkcs12", "-storepass:env", STOREPASS_ENV])
            .env(STOREPASS_ENV, keystore.password());
        command
    }

    fn run(
        &self,
        operation: &'static str,
        keystore: &Keystore,
        args: Vec<String>,
        stdin: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        debug!(operation, program = %self.program.display(), "invoking keytool");

        let tool_error = |message: String| KeyError::KeyTool { operation, message };

        let mut child = self
            .command(keystore, &args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| tool_error(format!("spawn {}: {e}", self.program.display())))?;

        if let Some(input) = stdin {
            let mut pipe = child
                .stdin
                .take()
                .ok_or_else(|| tool_error("stdin not captured".into()))?;
            pipe.write_all(input)
                .map_err(|e| tool_error(format!("write stdin: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| tool_error(format!("wait: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(tool_error(format!("{} ({detail})", output.status)));
        }

        Ok(output.stdout)
    }
}

impl KeyTool for ProcessKeyTool {
    fn generate_key_pair(&self, keystore: &Keystore, spec: &KeyPairSpec<'_>) -> Result<()> {
        let mut args: Vec<String> = vec![
            "-genkeypair".into(),
            "-alias".into(),
            spec.alias.into(),
            "-dname".into(),
            format!("CN={}", spec.common_name),
            "-validity".into(),
            spec.validity_days.to_string(),
        ];
        args.extend(spec.algorithm.keytool_args().iter().map(|s| s.to_string()));
        self.run("generate key pair", keystore, args, None).map(|_| ())
    }

    fn cert_request(&self, keystore: &Keystore, alias: &str) -> Result<Vec<u8>> {
        let mut args: Vec<String> = vec!["-certreq".into(), "-alias".into(), alias.into()];
        self.run("certificate request", keystore, args, None)
    }

    fn sign_cert(
        &self,
        keystore: &Keystore,
        issuer_alias: &str,
        csr: &[u8],
        validity_days: i64,
    ) -> Result<Vec<u8>> {
        let mut args: Vec<String> = vec![
            "-gencert".into(),
            "-alias".into(),
            issuer_alias.into(),
            "-validity".into(),
            validity_days.to_string(),
            "-rfc".into(),
        ];
        self.run("sign certificate", keystore, args, Some(csr))
    }

    fn import_cert(&self, keystore: &Keystore, alias: &str, cert: &[u8]) -> Result<()> {
        let mut args: Vec<String> = vec![
            "-importcert".into(),
            "-alias".into(),
            alias.into(),
            "-noprompt".into(),
        ];
        self.run("import certificate", keystore, args, Some(cert)).map(|_| ())
    }

    fn export_cert(&self, keystore: &Keystore, alias: &str) -> Result<Vec<u8>> {
        let mut args: Vec<String> = vec![
            "-exportcert".into(),
            "-alias".into(),
            alias.into(),
            "-rfc".into(),
        ];
        self.run("export certificate", keystore, args, None)
    }

    fn delete_entry(&self, keystore: &Keystore, alias: &str) -> Result<()> {
        let mut args: Vec<String> = vec!["-delete".into(), "-alias".into(), alias.into()];
        self.run("delete entry", keystore, args, None).map(|_| ())
    }

    fn list_aliases(&self, keystore: &Keystore) -> Result<Vec<String>> {
        if !keystore.exists() {
            return Ok(Vec::new());
        }
        let mut args: Vec<String> = vec!["-list".into()];
        let stdout = self.run("list entries", keystore, args, None)?;
        Ok(parse_list_output(&String::from_utf8_lossy(&stdout)))
    }
}

/// Extract aliases from `keytool -list` output, whose entry lines look like
/// `s-private-node0, Jan 1, 2025, PrivateKeyEntry,`.
fn parse_list_output(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| line.contains("Entry,"))
        .filter_map(|line| line.split(',').next())
        .map(|alias| alias.trim().to_string())
        .filter(|alias| !alias.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::ffi::OsStr;

    use super::*;

    #[test]
    fn parses_list_output() {
        let output = "\
Keystore type: PKCS12
Keystore provider: SUN

Your keystore contains 2 entries

s-public-node0, Jan 1, 2025, trustedCertEntry,
Certificate fingerprint (SHA-256): AB:CD
a-private-node0, Jan 1, 2025, PrivateKeyEntry,
Certificate fingerprint (SHA-256): EF:01
";
        assert_eq!(
            parse_list_output(output),
            vec!["s-public-node0".to_string(), "a-private-node0".to_string()]
        );
    }

    #[test]
    fn store_password_stays_out_of_argv() {
        let tool = ProcessKeyTool::default();
        let keystore = Keystore::new("/tmp/private-node0.pfx", "s3cret");
        let command = tool.command(&keystore, &["-list".to_string()]);

        let args: Vec<_> = command.get_args().collect();
        assert!(args.iter().all(|arg| *arg != "s3cret"));
        assert!(args.iter().any(|arg| *arg == "-storepass:env"));
        let env: Vec<_> = command.get_envs().collect();
        assert_eq!(
            env,
            vec![(OsStr::new(STOREPASS_ENV), Some(OsStr::new("s3cret")))]
        );
    }

    #[test]
    fn missing_program_is_a_key_tool_error() {
        let tool = ProcessKeyTool::new("/nonexistent/keytool");
        let keystore = Keystore::new("/tmp/never.pfx", "password");
        let err = tool.cert_request(&keystore, "s-private-node0").unwrap_err();
        assert!(matches!(err, KeyError::KeyTool { .. }));
    }

    #[test]
    fn list_of_missing_store_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ProcessKeyTool::default();
        let keystore = Keystore::new(dir.path().join("public.pfx"), "password");
        assert!(tool.list_aliases(&keystore).unwrap().is_empty());
    }
}
