//! Steward kubehub: list+watch wiring between the Kubernetes API and the
//! local [`Store`].

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use metrics::counter;
use steward_core::{ObjectSnapshot, Uid};
use steward_store::Store;
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Parse `version/Kind` (core group) or `group/version/Kind`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() })
        }
        [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() })
        }
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// Resolve a GVK to its API resource and whether it is namespaced.
pub async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await.context("running API discovery")?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn to_uid(uid_str: &str) -> Result<Uid> {
    let u = Uuid::parse_str(uid_str).context("parsing metadata.uid as uuid")?;
    Ok(*u.as_bytes())
}

/// Shape a watched object into the store's snapshot type.
pub fn snapshot_from(obj: &DynamicObject) -> Result<ObjectSnapshot> {
    let name = obj.metadata.name.clone().ok_or_else(|| anyhow!("object missing metadata.name"))?;
    let uid = obj.metadata.uid.as_deref().map(to_uid).transpose()?;
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    Ok(ObjectSnapshot {
        namespace: obj.metadata.namespace.clone(),
        name,
        uid,
        resource_version: obj.metadata.resource_version.clone(),
        raw,
    })
}

fn shape(obj: &DynamicObject) -> Option<ObjectSnapshot> {
    match snapshot_from(obj) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(error = %e, name = ?obj.metadata.name, "skipping unusable object");
            None
        }
    }
}

/// Bare identity of an object whose body could not be converted; enough to
/// remove it from the store by key.
fn identity_of(obj: &DynamicObject) -> Option<ObjectSnapshot> {
    let name = obj.metadata.name.clone()?;
    Some(ObjectSnapshot {
        namespace: obj.metadata.namespace.clone(),
        name,
        uid: None,
        resource_version: obj.metadata.resource_version.clone(),
        raw: serde_json::Value::Null,
    })
}

/// Apply one watcher event to the store.
pub fn apply_event(store: &Store, ev: Event<DynamicObject>) {
    match ev {
        Event::Applied(o) => {
            counter!("steward_watch_events_total", 1u64, "kind" => "applied");
            if let Some(s) = shape(&o) {
                store.apply(s);
            }
        }
        Event::Deleted(o) => {
            counter!("steward_watch_events_total", 1u64, "kind" => "deleted");
            if let Some(s) = shape(&o).or_else(|| identity_of(&o)) {
                store.delete(s);
            }
        }
        Event::Restarted(list) => {
            counter!("steward_watch_events_total", 1u64, "kind" => "restarted");
            debug!(count = list.len(), "watch restart");
            store.replace(list.iter().filter_map(shape).collect());
        }
    }
}

/// Build an `Api` for the GVK, scoped to `namespace` when it is namespaced.
pub async fn dynamic_api(client: Client, gvk_key: &str, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
    let gvk = parse_gvk_key(gvk_key)?;
    let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
    let api = match (namespaced, namespace) {
        (true, Some(ns)) => Api::namespaced_with(client, ns, &ar),
        _ => Api::all_with(client, &ar),
    };
    Ok(api)
}

async fn tick(resync: &mut Option<Interval>) {
    match resync {
        Some(t) => {
            t.tick().await;
        }
        None => futures::future::pending::<()>().await,
    }
}

/// List+watch `api` into `store` until `cancel` fires.
///
/// Watch errors are retried with kube's default backoff. Every
/// `resync_period` all objects are replayed as unchanged updates.
pub async fn run_reflector(
    api: Api<DynamicObject>,
    store: Arc<Store>,
    resync_period: Option<Duration>,
    cancel: CancellationToken,
) -> Result<()> {
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    let mut resync = resync_period
        .filter(|p| !p.is_zero())
        .map(|p| tokio::time::interval_at(Instant::now() + p, p));
    info!(resync_secs = ?resync_period.map(|p| p.as_secs()), "reflector started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("reflector stopping");
                return Ok(());
            }
            _ = tick(&mut resync) => store.resync(),
            ev = stream.next() => match ev {
                Some(Ok(ev)) => apply_event(&store, ev),
                Some(Err(e)) => {
                    counter!("steward_watch_errors_total", 1u64);
                    warn!(error = %e, "watch error; backing off");
                }
                None => {
                    warn!("watcher stream ended");
                    return Ok(());
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use steward_core::{CacheReader, EventSource};

    fn crontab(name: &str, rv: &str) -> DynamicObject {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "stable.example.com/v1beta1",
            "kind": "CronTab",
            "metadata": {
                "name": name,
                "namespace": "default",
                "uid": "6f1c1a36-4f1e-4c59-9a53-2a4f0c2b9d11",
                "resourceVersion": rv,
                "managedFields": [{ "manager": "kubectl" }],
            },
            "spec": { "cronSpec": "* * * * */5", "image": "my-awesome-cron-image" },
        }))
        .unwrap()
    }

    #[test]
    fn parse_gvk_key_parses_core() {
        let gvk = parse_gvk_key("v1/ConfigMap").expect("ok");
        assert_eq!(gvk.group, "");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk.kind, "ConfigMap");
    }

    #[test]
    fn parse_gvk_key_parses_group() {
        let gvk = parse_gvk_key("stable.example.com/v1beta1/CronTab").expect("ok");
        assert_eq!(gvk.group, "stable.example.com");
        assert_eq!(gvk.version, "v1beta1");
        assert_eq!(gvk.kind, "CronTab");
    }

    #[test]
    fn parse_gvk_key_invalid_returns_err() {
        assert!(parse_gvk_key("invalid").is_err());
        assert!(parse_gvk_key("").is_err());
        assert!(parse_gvk_key("a/b/c/d").is_err());
        assert!(parse_gvk_key("/v1/Kind").is_err());
    }

    #[test]
    fn snapshot_keeps_identity_and_version_but_not_managed_fields() {
        let s = snapshot_from(&crontab("foo", "12")).unwrap();
        assert_eq!(s.key().unwrap().to_string(), "default/foo");
        assert_eq!(s.resource_version.as_deref(), Some("12"));
        assert!(s.uid.is_some());
        assert!(s.raw["metadata"].get("managedFields").is_none());
        assert_eq!(s.spec_field("cronSpec").and_then(|v| v.as_str()), Some("* * * * */5"));
    }

    #[test]
    fn snapshot_requires_a_name() {
        let mut o = crontab("foo", "1");
        o.metadata.name = None;
        assert!(snapshot_from(&o).is_err());
    }

    #[test]
    fn watch_events_drive_the_store() {
        let store = Store::new();
        apply_event(&store, Event::Restarted(vec![crontab("a", "1"), crontab("b", "1")]));
        assert!(store.has_synced());
        assert_eq!(store.len(), 2);

        apply_event(&store, Event::Applied(crontab("a", "2")));
        apply_event(&store, Event::Deleted(crontab("b", "1")));
        assert_eq!(store.get(Some("default"), "a").unwrap().resource_version.as_deref(), Some("2"));
        assert!(store.get(Some("default"), "b").is_none());
    }

    #[test]
    fn delete_with_unparsable_uid_still_evicts_the_object() {
        let store = Store::new();
        apply_event(&store, Event::Applied(crontab("a", "1")));
        let mut gone = crontab("a", "2");
        gone.metadata.uid = Some("not-a-uuid".into());
        assert!(snapshot_from(&gone).is_err());

        apply_event(&store, Event::Deleted(gone));
        assert!(store.get(Some("default"), "a").is_none());
        assert!(store.is_empty());
    }
}
