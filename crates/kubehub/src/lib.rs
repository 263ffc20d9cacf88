//! Recon kubehub: a Kubernetes API server as the remote resource store.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use futures::StreamExt;
use kube::{
    api::{Api, ListParams, WatchParams},
    core::{DynamicObject, ErrorResponse, GroupVersionKind, WatchEvent},
    discovery::{ApiResource, Discovery, Scope},
    Client,
};
use recon_core::{EventStream, ListFilter, Listing, RemoteError, RemoteEvent, RemoteResourceApi, ResourceObject};
use tracing::{debug, info, warn};

/// Server-side watch timeout; the reflector resumes when it elapses.
const WATCH_TIMEOUT_SECS: u32 = 290;

fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() }),
        [group, version, kind] => Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
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

fn to_resource(obj: &DynamicObject) -> Option<ResourceObject> {
    let mut raw = match serde_json::to_value(obj) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "serializing DynamicObject failed; skipping");
            return None;
        }
    };
    strip_managed_fields(&mut raw);
    match ResourceObject::from_raw(raw) {
        Ok(o) => Some(o),
        Err(e) => {
            warn!(error = %e, "object without usable identity; skipping");
            None
        }
    }
}

fn classify_response(resp: &ErrorResponse) -> RemoteError {
    let msg = format!("{} ({}): {}", resp.reason, resp.code, resp.message);
    match resp.code {
        410 => RemoteError::Expired(msg),
        401 | 403 | 404 => RemoteError::Fatal(msg),
        _ => RemoteError::Transient(msg),
    }
}

fn classify(e: kube::Error) -> RemoteError {
    match &e {
        kube::Error::Api(resp) => classify_response(resp),
        _ => RemoteError::Transient(e.to_string()),
    }
}

/// List/watch access to one resource kind, resolved through discovery.
#[derive(Clone)]
pub struct KubeResourceApi {
    client: Client,
    resource: ApiResource,
    namespaced: bool,
}

impl KubeResourceApi {
    /// Resolve a GVK key such as `v1/Pod` or `apps/v1/Deployment` using the default kubeconfig.
    pub async fn for_gvk(gvk_key: &str) -> Result<Self> {
        let client = Client::try_default().await?;
        let gvk = parse_gvk_key(gvk_key)?;
        let (resource, namespaced) = find_api_resource(client.clone(), &gvk).await?;
        info!(gvk = %gvk_key, namespaced, "resource resolved");
        Ok(Self { client, resource, namespaced })
    }

    fn api_for(&self, filter: &ListFilter) -> Api<DynamicObject> {
        match (&filter.namespace, self.namespaced) {
            (Some(ns), true) => Api::namespaced_with(self.client.clone(), ns, &self.resource),
            _ => Api::all_with(self.client.clone(), &self.resource),
        }
    }
}

fn list_params(filter: &ListFilter) -> ListParams {
    let mut lp = ListParams::default();
    if let Some(l) = &filter.label_selector {
        lp = lp.labels(l);
    }
    if let Some(f) = &filter.field_selector {
        lp = lp.fields(f);
    }
    lp
}

fn watch_params(filter: &ListFilter) -> WatchParams {
    let mut wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
    if let Some(l) = &filter.label_selector {
        wp = wp.labels(l);
    }
    if let Some(f) = &filter.field_selector {
        wp = wp.fields(f);
    }
    wp
}

fn convert(ev: WatchEvent<DynamicObject>) -> Option<Result<RemoteEvent, RemoteError>> {
    match ev {
        WatchEvent::Added(o) => to_resource(&o).map(|o| Ok(RemoteEvent::Added(o))),
        WatchEvent::Modified(o) => to_resource(&o).map(|o| Ok(RemoteEvent::Modified(o))),
        WatchEvent::Deleted(o) => to_resource(&o).map(|o| Ok(RemoteEvent::Deleted(o))),
        WatchEvent::Bookmark(b) => Some(Ok(RemoteEvent::Bookmark { version: b.metadata.resource_version })),
        WatchEvent::Error(resp) => Some(Err(classify_response(&resp))),
    }
}

#[async_trait::async_trait]
impl RemoteResourceApi for KubeResourceApi {
    async fn list(&self, filter: &ListFilter) -> Result<Listing, RemoteError> {
        let list = self.api_for(filter).list(&list_params(filter)).await.map_err(classify)?;
        let version = list.metadata.resource_version.unwrap_or_default();
        let items: Vec<_> = list.items.iter().filter_map(to_resource).collect();
        debug!(items = items.len(), version = %version, "listed");
        Ok(Listing { items, version })
    }

    async fn watch(&self, version: &str, filter: &ListFilter) -> Result<EventStream, RemoteError> {
        let api = self.api_for(filter);
        let wp = watch_params(filter);
        let version = version.to_string();
        let stream = async_stream::stream! {
            let inner = match api.watch(&wp, &version).await {
                Ok(s) => s,
                Err(e) => {
                    yield Err(classify(e));
                    return;
                }
            };
            futures::pin_mut!(inner);
            while let Some(item) = inner.next().await {
                match item {
                    Ok(ev) => {
                        if let Some(converted) = convert(ev) {
                            yield converted;
                        }
                    }
                    Err(e) => {
                        yield Err(classify(e));
                        return;
                    }
                }
            }
        };
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(code: u16) -> ErrorResponse {
        ErrorResponse { status: "Failure".into(), message: "m".into(), reason: "r".into(), code }
    }

    #[test]
    fn gvk_keys_parse() {
        let core = parse_gvk_key("v1/Pod").unwrap();
        assert_eq!((core.group.as_str(), core.version.as_str(), core.kind.as_str()), ("", "v1", "Pod"));
        let apps = parse_gvk_key("apps/v1/Deployment").unwrap();
        assert_eq!(apps.group, "apps");
        assert!(parse_gvk_key("Pod").is_err());
    }

    #[test]
    fn status_codes_map_to_remote_errors() {
        assert!(matches!(classify_response(&response(410)), RemoteError::Expired(_)));
        assert!(matches!(classify_response(&response(403)), RemoteError::Fatal(_)));
        assert!(matches!(classify_response(&response(500)), RemoteError::Transient(_)));
    }

    #[test]
    fn managed_fields_are_stripped() {
        let mut v = serde_json::json!({ "metadata": { "name": "a", "managedFields": [{}] } });
        strip_managed_fields(&mut v);
        assert!(v["metadata"].get("managedFields").is_none());
        assert_eq!(v["metadata"]["name"], "a");
    }

    #[test]
    fn watch_errors_convert() {
        assert!(matches!(convert(WatchEvent::Error(response(410))), Some(Err(RemoteError::Expired(_)))));
        assert!(matches!(convert(WatchEvent::Error(response(500))), Some(Err(RemoteError::Transient(_)))));
    }
}
