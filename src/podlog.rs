//! Best-effort pod log archiver
//!
//! Watches every pod of the namespace and streams each running container's
//! log into its own file. The archiver is fire-and-forget: the controller
//! never awaits it, and every failure to open a file or a log stream is
//! logged and skipped. Streams are deduplicated by (pod, container, uid) so
//! a pod recreated under the same name gets a fresh log file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::SecondsFormat;
use futures::{pin_mut, AsyncReadExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, LogParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Result;

/// Streams pod logs to files until shutdown
pub struct PodLogArchiver;

impl PodLogArchiver {
    /// Begin archiving the namespace's pod logs under `logdir`.
    ///
    /// Creates the target directory, then detaches; the returned future
    /// resolves as soon as the watch task is running.
    pub async fn start(
        client: Client,
        shutdown: CancellationToken,
        namespace: &str,
        logdir: &Path,
    ) -> Result<()> {
        let directory = logdir.join(namespace);
        tokio::fs::create_dir_all(&directory).await?;

        let api: Api<Pod> = Api::namespaced(client, namespace);
        tokio::spawn(watch_pods(api, shutdown, directory));
        Ok(())
    }
}

async fn watch_pods(api: Api<Pod>, shutdown: CancellationToken, directory: PathBuf) {
    // Exclusively owned by this task; pods recreated under the same name
    // carry a new uid and therefore a new key.
    let mut known: HashSet<String> = HashSet::new();

    let stream = watcher(api.clone(), watcher::Config::default())
        .default_backoff()
        .applied_objects();
    pin_mut!(stream);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("pod log archiver stopping");
                return;
            }
            event = stream.next() => match event {
                Some(Ok(pod)) => archive_pod_containers(&api, &mut known, &directory, &pod).await,
                Some(Err(error)) => warn!(error = %error, "pod watch error"),
                None => return,
            }
        }
    }
}

async fn archive_pod_containers(
    api: &Api<Pod>,
    known: &mut HashSet<String>,
    directory: &Path,
    pod: &Pod,
) {
    if !pod_initialized(pod) {
        return;
    }

    let pod_name = pod.name_any();
    let uid = pod.metadata.uid.clone().unwrap_or_default();
    let Some(statuses) = pod.status.as_ref().and_then(|s| s.container_statuses.as_ref()) else {
        return;
    };

    for status in statuses {
        let key = container_key(&pod_name, &status.name, &uid);
        if known.contains(&key) {
            continue;
        }

        let Some(running) = status.state.as_ref().and_then(|s| s.running.as_ref()) else {
            continue;
        };
        let started_at = running
            .started_at
            .as_ref()
            .map(|t| t.0.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default();

        let file_name = directory.join(format!("{started_at}_{key}.log"));
        let file = match tokio::fs::File::create(&file_name).await {
            Ok(file) => file,
            Err(error) => {
                warn!(file = %file_name.display(), error = %error, "failed to create log file");
                continue;
            }
        };

        let params = LogParams {
            follow: true,
            container: Some(status.name.clone()),
            ..LogParams::default()
        };
        let stream = match api.log_stream(&pod_name, &params).await {
            Ok(stream) => stream,
            Err(error) => {
                warn!(pod = %pod_name, container = %status.name, error = %error,
                    "failed to obtain pod log stream");
                continue;
            }
        };

        known.insert(key.clone());
        info!(pod = %pod_name, container = %status.name, uid = %uid, "receiving pod log");
        tokio::spawn(copy_log(stream, file, key));
    }
}

async fn copy_log<R>(stream: R, mut file: tokio::fs::File, key: String)
where
    R: futures::AsyncRead + Send + 'static,
{
    let mut reader = Box::pin(stream);
    let mut buffer = [0u8; 8192];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(error) = file.write_all(&buffer[..n]).await {
                    warn!(container = %key, error = %error, "failed to write log file");
                    break;
                }
            }
            Err(error) => {
                warn!(container = %key, error = %error, "error during log copy");
                break;
            }
        }
    }
    file.flush().await.ok();
    debug!(container = %key, "log completed");
}

fn container_key(pod: &str, container: &str, uid: &str) -> String {
    format!("{pod}_{container}_{uid}")
}

fn pod_initialized(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Initialized" && c.status == "True")
        })
}
