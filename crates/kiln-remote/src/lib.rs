//! Remote Cache Client (spec component D): a synchronous client for the
//! key-based artifact server (KBAS) protocol — plain `GET`/`POST` over
//! HTTP, status-code-driven behavior.

use std::path::PathBuf;

use kiln_cas::Store;
use kiln_core::{Definition, Error, Kind, Result, RunContext};
use reqwest::blocking::Client;
use tracing::{debug, warn};

pub struct KbasClient {
    client: Client,
}

impl Default for KbasClient {
    fn default() -> Self {
        KbasClient {
            client: Client::new(),
        }
    }
}

impl KbasClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// `GET <url>/get/<key>`. Marks `definition` as `tried` before issuing
    /// the request, so a transient failure is never retried within the
    /// same run. Any failure (not a non-200 status, a genuine request
    /// error) disables the remote for the rest of the run.
    pub fn try_get(
        &self,
        ctx: &RunContext,
        store: &Store,
        definition: &Definition,
        key: &str,
    ) -> Result<Option<PathBuf>> {
        if definition.runtime.tried.get() {
            return Ok(None);
        }
        if definition.kind != Kind::Chunk {
            return Ok(None);
        }
        let Some(base) = ctx.kbas_url.borrow().clone() else {
            return Ok(None);
        };

        definition.runtime.tried.set(true);
        debug!(key, "try downloading");

        let url = format!("{}/get/{}", base.trim_end_matches('/'), key);
        let response = match self.client.get(&url).send() {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "remote artifact server is not working");
                ctx.disable_remote();
                return Ok(None);
            }
        };

        if response.status().as_u16() != 200 {
            return Ok(None);
        }

        let staging = tempfile::Builder::new()
            .prefix("remote-get-")
            .tempdir_in(&ctx.tmp)
            .map_err(|e| Error::io(e, "creating remote staging tmpdir", Some(ctx.tmp.clone())))?;
        let cachefile = staging.path().join(key);
        let bytes = match response.bytes() {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, key, "failed downloading");
                return Ok(None);
            }
        };
        std::fs::write(&cachefile, &bytes)
            .map_err(|e| Error::io(e, "writing downloaded archive", Some(cachefile.clone())))?;

        let path = store.adopt(key, staging, &cachefile)?;
        Ok(Some(path))
    }

    /// `POST <url>/upload` multipart with `{filename, password, checksum}`.
    /// Only `chunk` and `stratum` kinds are uploaded.
    pub fn try_push(
        &self,
        ctx: &RunContext,
        store: &Store,
        definition: &Definition,
        key: &str,
    ) -> Result<()> {
        if !matches!(definition.kind, Kind::Chunk | Kind::Stratum) {
            return Ok(());
        }
        if !ctx.remote_writable() {
            return Ok(());
        }
        let base = ctx.kbas_url.borrow().clone().unwrap();
        let password = ctx.kbas_password.clone().unwrap_or_default();

        let archive_path = store.artifact_path(key);
        let checksum = kiln_cas::md5_file(&archive_path)?;
        let bytes = std::fs::read(&archive_path)
            .map_err(|e| Error::io(e, "reading archive for upload", Some(archive_path.clone())))?;

        let url = format!("{}/upload", base.trim_end_matches('/'));
        let form = reqwest::blocking::multipart::Form::new()
            .text("filename", key.to_string())
            .text("password", password)
            .text("checksum", checksum.clone())
            .part(
                "file",
                reqwest::blocking::multipart::Part::bytes(bytes).file_name(key.to_string()),
            );

        let response = match self.client.post(&url).multipart(form).send() {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, key, "failed to upload");
                return Ok(());
            }
        };

        match response.status().as_u16() {
            201 => {
                debug!(key, %url, "uploaded");
                Ok(())
            }
            777 => {
                debug!(key, checksum, "reproduced artifact at server");
                ctx.record_reproduction(checksum, key.to_string());
                Ok(())
            }
            405 => {
                if definition.kind == Kind::Stratum && ctx.reproduce {
                    return Err(Error::RemoteConflict { key: key.to_string() });
                }
                debug!(key, "artifact server already has this key under different content");
                Ok(())
            }
            other => {
                warn!(key, status = other, "artifact server problem");
                Ok(())
            }
        }
    }
}
