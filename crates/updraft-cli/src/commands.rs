//! CLI command implementations.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use updraft_core::keys::{generate_signing_key, load_signing_key, save_keypair};
use updraft_core::notification::Notification;
use updraft_daemon::api::SubmitRequest;

use crate::client::AgentClient;

/// Arguments for [`submit`].
pub struct SubmitArgs {
    pub file: PathBuf,
    pub uuid: String,
    pub version: Option<u64>,
    pub key: PathBuf,
    pub tracker: String,
    pub piece_length: u64,
    pub output: Option<PathBuf>,
}

/// Generates and stores a fresh keypair.
pub fn keygen(out: &Path) -> Result<()> {
    let key = generate_signing_key();
    save_keypair(out, &key).context("failed writing keypair")?;
    println!("signing key:   {}", out.display());
    println!("verifying key: {}", out.with_extension("pub").display());
    Ok(())
}

/// Builds, signs, and submits (or writes out) an update.
pub fn submit(agent: &AgentClient, args: SubmitArgs) -> Result<()> {
    if !args.file.exists() {
        bail!("update file '{}' does not exist", args.file.display());
    }
    let source = args
        .file
        .canonicalize()
        .context("failed resolving the update file path")?;
    let key = load_signing_key(&args.key).context("failed loading the signing key")?;

    let version = args.version.unwrap_or_else(|| {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
    });
    let notification = Notification::for_file(
        &source,
        &args.uuid,
        version,
        &args.tracker,
        args.piece_length,
        &key,
    )
    .context("failed building the notification")?;

    let request = SubmitRequest {
        source,
        notification,
    };
    let json = serde_json::to_vec(&request)?;

    if let Some(output) = args.output {
        if output.as_os_str() == "-" {
            println!("{}", String::from_utf8_lossy(&json));
        } else {
            std::fs::write(&output, &json)
                .with_context(|| format!("failed writing {}", output.display()))?;
            println!("wrote {}", output.display());
        }
        return Ok(());
    }

    let response = agent.post_json("/update", &json)?;
    match response.status {
        200 => {
            println!("submitted {} version {version}", args.uuid);
            Ok(())
        },
        208 => bail!("update {} version {version} already exists", args.uuid),
        406 => bail!("update {} version {version} is older than the installed one", args.uuid),
        401 => bail!("the agent rejected the signature"),
        403 => bail!("the agent could not copy the source file"),
        404 => bail!("the agent cannot read '{}'", args.file.display()),
        status => bail!("submission failed with status {status}"),
    }
}

/// GETs a path and pretty-prints the JSON body.
pub fn show(agent: &AgentClient, path: &str) -> Result<()> {
    let response = agent.get(path)?;
    if response.status == 404 {
        bail!("not found");
    }
    if response.status != 200 {
        bail!("request failed with status {}", response.status);
    }
    println!("{}", response.body_pretty());
    Ok(())
}

/// Deletes an update.
pub fn delete(agent: &AgentClient, uuid: &str) -> Result<()> {
    let response = agent.delete(&format!("/update/{uuid}"))?;
    if response.status != 200 {
        bail!("delete failed with status {}", response.status);
    }
    println!("deleted {uuid}");
    Ok(())
}

/// Forces a re-broadcast.
pub fn rebroadcast(agent: &AgentClient, uuid: &str) -> Result<()> {
    let response = agent.patch(&format!("/update/{uuid}"))?;
    match response.status {
        200 => {
            println!("re-broadcast {uuid}");
            Ok(())
        },
        404 => bail!("unknown update {uuid}"),
        status => bail!("re-broadcast failed with status {status}"),
    }
}
