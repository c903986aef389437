//! Watch-before-mutate pod operations
//!
//! Both deletion and eviction establish a field-selected watch on the pod
//! before issuing the mutating request, then consume watch events until the
//! deletion is confirmed. Losing the deletion event between submission and
//! watch attachment is therefore impossible.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::gateway::{ClusterGateway, DeleteOptions, PodEvent, PodWatch};
use crate::{Error, Result, EVICTION_RETRY_PAUSE};

/// Delete a pod and wait for its deletion event.
///
/// Errors from the watch open and from the delete request are surfaced
/// unchanged; a closed watch channel fails with [`Error::WatchClosed`].
pub async fn delete_pod<G: ClusterGateway + ?Sized>(
    gateway: &G,
    shutdown: &CancellationToken,
    namespace: &str,
    name: &str,
    options: &DeleteOptions,
) -> Result<()> {
    let mut watch = gateway.watch_pod(namespace, name).await?;

    info!(namespace = %namespace, pod = %name, "deleting pod");
    gateway.delete_pod(namespace, name, options).await?;

    await_deletion(shutdown, &mut watch, namespace, name).await
}

/// Evict a pod through the eviction subresource and wait for its deletion.
///
/// The eviction state machine: open the pre-watch (`NotFound` means the pod
/// is already gone and terminates with success), then submit evictions until
/// one is accepted. `TooManyRequests` is the pod-disruption-budget contract
/// and pauses for 2 seconds before resubmitting; there is no attempt cap,
/// only cancellation bounds the loop. Finally, consume watch events until
/// the pod's deletion is observed.
pub async fn evict_pod<G: ClusterGateway + ?Sized>(
    gateway: &G,
    shutdown: &CancellationToken,
    namespace: &str,
    name: &str,
    options: &DeleteOptions,
) -> Result<()> {
    let mut watch = match gateway.watch_pod(namespace, name).await {
        Ok(watch) => watch,
        Err(error) if error.is_not_found() => return Ok(()),
        Err(error) => return Err(error),
    };

    loop {
        match gateway.evict_pod(namespace, name, options).await {
            Ok(()) => {
                info!(namespace = %namespace, pod = %name, "created eviction");
                break;
            }
            Err(error) if error.is_not_found() => return Ok(()),
            Err(error) if error.is_throttled() => {
                debug!(
                    namespace = %namespace,
                    pod = %name,
                    "eviction throttled by disruption budget, retrying"
                );
                tokio::select! {
                    _ = shutdown.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(EVICTION_RETRY_PAUSE) => {}
                }
            }
            Err(error) => return Err(error),
        }
    }

    await_deletion(shutdown, &mut watch, namespace, name).await
}

async fn await_deletion(
    shutdown: &CancellationToken,
    watch: &mut PodWatch,
    namespace: &str,
    name: &str,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Err(Error::Cancelled),
            event = watch.next() => match event {
                Some(PodEvent::Deleted) => {
                    info!(namespace = %namespace, pod = %name, "pod gone");
                    return Ok(());
                }
                Some(PodEvent::Other) => {}
                None => return Err(Error::WatchClosed),
            },
        }
    }
}
