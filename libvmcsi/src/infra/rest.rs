//! HTTP client for the infra cluster API server.
//!
//! One [`InfraClient`] is built at startup and shared (behind an `Arc`) by
//! every RPC.  `reqwest::Client` pools connections internally, so the handle
//! is cheap to use concurrently and needs no locking.

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;

use super::{
    DataVolume, DiskImageRepository, HotplugVolumeRequest, InfraError, VirtualMachineInstance,
    VmAttachmentManager,
};
use crate::config::InfraClusterConfig;

const CDI_GROUP: [&str; 3] = ["apis", "cdi.kubevirt.io", "v1beta1"];
const KUBEVIRT_GROUP: [&str; 3] = ["apis", "kubevirt.io", "v1"];
const SUBRESOURCES_GROUP: [&str; 3] = ["apis", "subresources.kubevirt.io", "v1"];

/// Generic list envelope returned by collection endpoints.
#[derive(Debug, Deserialize)]
struct ObjectList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

/// Error body returned by the API server on failure.
#[derive(Debug, Deserialize)]
struct StatusBody {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Serialize)]
struct DiskTarget<'a> {
    bus: &'a str,
}

#[derive(Debug, Serialize)]
struct Disk<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    serial: &'a str,
    disk: DiskTarget<'a>,
}

#[derive(Debug, Serialize)]
struct HotplugDataVolumeSource<'a> {
    name: &'a str,
    hotpluggable: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HotplugVolumeSource<'a> {
    data_volume: HotplugDataVolumeSource<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AddVolumeOptions<'a> {
    name: &'a str,
    disk: Disk<'a>,
    volume_source: HotplugVolumeSource<'a>,
}

#[derive(Debug, Serialize)]
struct RemoveVolumeOptions<'a> {
    name: &'a str,
}

/// Infra cluster API client implementing both API seams.
#[derive(Clone)]
pub struct InfraClient {
    http: reqwest::Client,
    base: Url,
}

impl InfraClient {
    pub fn new(config: &InfraClusterConfig) -> Result<Self, InfraError> {
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.bearer_token))
            .map_err(|e| InfraError::Transport(format!("invalid bearer token: {e}")))?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout);
        if let Some(pem) = &config.ca_pem {
            let ca = reqwest::Certificate::from_pem(pem)
                .map_err(|e| InfraError::Transport(format!("invalid CA bundle: {e}")))?;
            builder = builder.tls_built_in_root_certs(false).add_root_certificate(ca);
        }
        let http = builder
            .build()
            .map_err(|e| InfraError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            base: config.api_url.clone(),
        })
    }

    /// Append `segments` to the API base URL, one path segment each.  A
    /// segment containing `/` is percent-encoded rather than split, so
    /// caller-supplied names cannot climb out of their collection.
    fn url<S: AsRef<str>>(&self, segments: &[S]) -> Result<Url, InfraError> {
        if let Some(bad) = segments
            .iter()
            .map(|s| s.as_ref())
            .find(|s| matches!(*s, "" | "." | ".."))
        {
            return Err(InfraError::InvalidName(bad.to_owned()));
        }
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| InfraError::Transport(format!("API URL {} has no path", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn data_volumes_path(namespace: &str) -> Vec<&str> {
        let mut path = CDI_GROUP.to_vec();
        path.extend(["namespaces", namespace, "datavolumes"]);
        path
    }

    fn vmis_path(namespace: &str) -> Vec<&str> {
        let mut path = KUBEVIRT_GROUP.to_vec();
        path.extend(["namespaces", namespace, "virtualmachineinstances"]);
        path
    }

    /// Hotplug subresource.  Persistent hotplugs go through the VM so they
    /// survive a restart; ephemeral ones only touch the running instance.
    fn hotplug_path<'a>(
        namespace: &'a str,
        vm_name: &'a str,
        ephemeral: bool,
        action: &'a str,
    ) -> Vec<&'a str> {
        let kind = if ephemeral {
            "virtualmachineinstances"
        } else {
            "virtualmachines"
        };
        let mut path = SUBRESOURCES_GROUP.to_vec();
        path.extend(["namespaces", namespace, kind, vm_name, action]);
        path
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &[&str],
        body: Option<&B>,
        object: &str,
    ) -> Result<reqwest::Response, InfraError> {
        let url = self.url(path)?;
        let mut req = self.http.request(method.clone(), url.clone());
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| InfraError::Transport(e.to_string()))?;

        let status = resp.status();
        debug!(%method, path = url.path(), %status, "infra API call");
        if status.is_success() {
            return Ok(resp);
        }

        let text = resp.text().await.unwrap_or_default();
        Err(classify(status, object, &text))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &[&str],
        object: &str,
    ) -> Result<T, InfraError> {
        let resp = self.send::<()>(Method::GET, path, None, object).await?;
        resp.json()
            .await
            .map_err(|e| InfraError::Decode(format!("{object}: {e}")))
    }
}

fn classify(status: StatusCode, object: &str, body: &str) -> InfraError {
    match status {
        StatusCode::NOT_FOUND => InfraError::NotFound(object.to_owned()),
        StatusCode::CONFLICT => InfraError::AlreadyExists(object.to_owned()),
        _ => {
            let message = serde_json::from_str::<StatusBody>(body)
                .map(|s| s.message)
                .ok()
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| body.trim().to_owned());
            InfraError::Api {
                status: status.as_u16(),
                message,
            }
        }
    }
}

#[async_trait]
impl DiskImageRepository for InfraClient {
    #[instrument(skip(self))]
    async fn list_disk_images(&self, namespace: &str) -> Result<Vec<DataVolume>, InfraError> {
        let list: ObjectList<DataVolume> = self
            .get_json(&Self::data_volumes_path(namespace), "datavolumes")
            .await?;
        Ok(list.items)
    }

    #[instrument(skip(self, dv), fields(name = %dv.name()))]
    async fn create_disk_image(
        &self,
        namespace: &str,
        dv: &DataVolume,
    ) -> Result<(), InfraError> {
        let mut dv = dv.clone();
        dv.metadata.namespace = Some(namespace.to_owned());
        let object = format!("datavolume {}", dv.name());
        self.send(
            Method::POST,
            &Self::data_volumes_path(namespace),
            Some(&dv),
            &object,
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_disk_image(&self, namespace: &str, name: &str) -> Result<(), InfraError> {
        let mut path = Self::data_volumes_path(namespace);
        path.push(name);
        self.send::<()>(Method::DELETE, &path, None, &format!("datavolume {name}"))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl VmAttachmentManager for InfraClient {
    #[instrument(skip(self))]
    async fn list_vms(&self, namespace: &str) -> Result<Vec<VirtualMachineInstance>, InfraError> {
        let list: ObjectList<VirtualMachineInstance> = self
            .get_json(&Self::vmis_path(namespace), "virtualmachineinstances")
            .await?;
        Ok(list.items)
    }

    #[instrument(skip(self))]
    async fn get_vm(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<VirtualMachineInstance, InfraError> {
        let mut path = Self::vmis_path(namespace);
        path.push(name);
        self.get_json(&path, &format!("virtualmachineinstance {name}"))
            .await
    }

    #[instrument(skip(self, req), fields(volume = %req.volume_name))]
    async fn add_volume(
        &self,
        namespace: &str,
        vm_name: &str,
        req: &HotplugVolumeRequest,
    ) -> Result<(), InfraError> {
        let Some(disk) = &req.disk else {
            return Err(InfraError::Api {
                status: 400,
                message: format!("attach of {} carries no disk device", req.volume_name),
            });
        };
        let body = AddVolumeOptions {
            name: &req.volume_name,
            disk: Disk {
                name: &disk.name,
                serial: &disk.serial,
                disk: DiskTarget { bus: &disk.bus },
            },
            volume_source: HotplugVolumeSource {
                data_volume: HotplugDataVolumeSource {
                    name: &req.data_volume,
                    hotpluggable: true,
                },
            },
        };
        let path = Self::hotplug_path(namespace, vm_name, req.ephemeral, "addvolume");
        let object = format!("volume {} on VM {vm_name}", req.volume_name);
        self.send(Method::PUT, &path, Some(&body), &object).await?;
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume = %req.volume_name))]
    async fn remove_volume(
        &self,
        namespace: &str,
        vm_name: &str,
        req: &HotplugVolumeRequest,
    ) -> Result<(), InfraError> {
        let body = RemoveVolumeOptions {
            name: &req.volume_name,
        };
        let path = Self::hotplug_path(namespace, vm_name, req.ephemeral, "removevolume");
        let object = format!("volume {} on VM {vm_name}", req.volume_name);
        self.send(Method::PUT, &path, Some(&body), &object).await?;
        Ok(())
    }
}
