//! Typed access to the objects the orchestration core reads and writes
//!
//! [`ClusterStore`] is the seam between orchestration logic and the API server.
//! Orchestration code only ever talks to the trait; [`KubeStore`] implements it
//! over `kube::Api`, and tests substitute an in-memory store.
//!
//! Conventions shared by every implementation:
//! - `get_*` returns `Ok(None)` when the object is absent
//! - `patch_*` applies a JSON merge patch
//! - `delete_*` is idempotent, deleting an absent object succeeds
//! - `create_*` fails with a 409 API error when the object already exists

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;

use crate::controller::Result;
use crate::crd::{PgCluster, PgClusterStatus, PgReplica, PgTask, PgTaskStatus};
use crate::resources::common::{FIELD_MANAGER, Selector};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<PgCluster>>;
    async fn create_cluster(&self, namespace: &str, cluster: &PgCluster) -> Result<PgCluster>;
    async fn patch_cluster(&self, namespace: &str, name: &str, patch: &Value) -> Result<()>;
    async fn patch_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        status: &PgClusterStatus,
    ) -> Result<()>;
    async fn delete_cluster(&self, namespace: &str, name: &str) -> Result<()>;

    async fn list_replicas(&self, namespace: &str, selector: &Selector) -> Result<Vec<PgReplica>>;
    async fn delete_replica(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_task(&self, namespace: &str, name: &str) -> Result<Option<PgTask>>;
    async fn create_task(&self, namespace: &str, task: &PgTask) -> Result<PgTask>;
    async fn patch_task(&self, namespace: &str, name: &str, patch: &Value) -> Result<()>;
    async fn patch_task_status(
        &self,
        namespace: &str,
        name: &str,
        status: &PgTaskStatus,
    ) -> Result<()>;
    async fn list_tasks(&self, namespace: &str, selector: &Selector) -> Result<Vec<PgTask>>;
    async fn delete_task(&self, namespace: &str, name: &str) -> Result<()>;

    async fn list_deployments(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<Deployment>>;
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;
    async fn create_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<()>;
    /// Persist a full deployment object, as mutated by the caller
    async fn replace_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<()>;
    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()>;
    async fn patch_deployment(&self, namespace: &str, name: &str, patch: &Value) -> Result<()>;
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()>;

    async fn list_pods(&self, namespace: &str, selector: &Selector) -> Result<Vec<Pod>>;
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;
    async fn patch_pod(&self, namespace: &str, name: &str, patch: &Value) -> Result<()>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;
    async fn create_service(&self, namespace: &str, service: &Service) -> Result<()>;
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()>;

    async fn list_pvcs(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<PersistentVolumeClaim>>;
    async fn get_pvc(&self, namespace: &str, name: &str)
    -> Result<Option<PersistentVolumeClaim>>;
    async fn create_pvc(&self, namespace: &str, pvc: &PersistentVolumeClaim) -> Result<()>;
    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<()>;
    /// Overwrite an existing secret in one write; keys absent from `secret` are dropped
    async fn replace_secret(&self, namespace: &str, secret: &Secret) -> Result<()>;

    async fn get_configmap(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;
    async fn create_configmap(&self, namespace: &str, config_map: &ConfigMap) -> Result<()>;
    async fn patch_configmap(&self, namespace: &str, name: &str, patch: &Value) -> Result<()>;
    async fn delete_configmap(&self, namespace: &str, name: &str) -> Result<()>;

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<()>;
    async fn delete_jobs(&self, namespace: &str, selector: &Selector) -> Result<()>;
}

/// [`ClusterStore`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn patch_params() -> PatchParams {
    PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

fn list_params(selector: &Selector) -> ListParams {
    let mut params = ListParams::default();
    let labels = selector.to_string();
    if !labels.is_empty() {
        params = params.labels(&labels);
    }
    if let Some(fields) = selector.field_selector() {
        params = params.fields(&fields);
    }
    params
}

async fn get_opt<K>(api: Api<K>, name: &str) -> Result<Option<K>>
where
    K: Clone + DeserializeOwned + Debug,
{
    Ok(api.get_opt(name).await?)
}

async fn list<K>(api: Api<K>, selector: &Selector) -> Result<Vec<K>>
where
    K: Clone + DeserializeOwned + Debug,
{
    Ok(api.list(&list_params(selector)).await?.items)
}

async fn create<K>(api: Api<K>, obj: &K) -> Result<K>
where
    K: Clone + Serialize + DeserializeOwned + Debug,
{
    Ok(api.create(&PostParams::default(), obj).await?)
}

async fn merge_patch<K>(api: Api<K>, name: &str, patch: &Value) -> Result<()>
where
    K: Clone + DeserializeOwned + Debug,
{
    api.patch(name, &patch_params(), &Patch::Merge(patch)).await?;
    Ok(())
}

async fn delete<K>(api: Api<K>, name: &str) -> Result<()>
where
    K: Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => {
            debug!(name, "object already absent");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<PgCluster>> {
        get_opt(self.api(namespace), name).await
    }

    async fn create_cluster(&self, namespace: &str, cluster: &PgCluster) -> Result<PgCluster> {
        create(self.api(namespace), cluster).await
    }

    async fn patch_cluster(&self, namespace: &str, name: &str, patch: &Value) -> Result<()> {
        merge_patch::<PgCluster>(self.api(namespace), name, patch).await
    }

    async fn patch_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        status: &PgClusterStatus,
    ) -> Result<()> {
        let api: Api<PgCluster> = self.api(namespace);
        let patch = json!({ "status": status });
        api.patch_status(name, &patch_params(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_cluster(&self, namespace: &str, name: &str) -> Result<()> {
        delete::<PgCluster>(self.api(namespace), name).await
    }

    async fn list_replicas(&self, namespace: &str, selector: &Selector) -> Result<Vec<PgReplica>> {
        list(self.api(namespace), selector).await
    }

    async fn delete_replica(&self, namespace: &str, name: &str) -> Result<()> {
        delete::<PgReplica>(self.api(namespace), name).await
    }

    async fn get_task(&self, namespace: &str, name: &str) -> Result<Option<PgTask>> {
        get_opt(self.api(namespace), name).await
    }

    async fn create_task(&self, namespace: &str, task: &PgTask) -> Result<PgTask> {
        create(self.api(namespace), task).await
    }

    async fn patch_task(&self, namespace: &str, name: &str, patch: &Value) -> Result<()> {
        merge_patch::<PgTask>(self.api(namespace), name, patch).await
    }

    async fn patch_task_status(
        &self,
        namespace: &str,
        name: &str,
        status: &PgTaskStatus,
    ) -> Result<()> {
        let api: Api<PgTask> = self.api(namespace);
        let patch = json!({ "status": status });
        api.patch_status(name, &patch_params(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn list_tasks(&self, namespace: &str, selector: &Selector) -> Result<Vec<PgTask>> {
        list(self.api(namespace), selector).await
    }

    async fn delete_task(&self, namespace: &str, name: &str) -> Result<()> {
        delete::<PgTask>(self.api(namespace), name).await
    }

    async fn list_deployments(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<Deployment>> {
        list(self.api(namespace), selector).await
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        get_opt(self.api(namespace), name).await
    }

    async fn create_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<()> {
        create(self.api(namespace), deployment).await.map(|_| ())
    }

    async fn replace_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<()> {
        let api: Api<Deployment> = self.api(namespace);
        let name = deployment
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| crate::controller::Error::NotFound("deployment name".to_string()))?;
        api.replace(name, &PostParams::default(), deployment).await?;
        Ok(())
    }

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        let patch = json!({ "spec": { "replicas": replicas } });
        merge_patch::<Deployment>(self.api(namespace), name, &patch).await
    }

    async fn patch_deployment(&self, namespace: &str, name: &str, patch: &Value) -> Result<()> {
        merge_patch::<Deployment>(self.api(namespace), name, patch).await
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        delete::<Deployment>(self.api(namespace), name).await
    }

    async fn list_pods(&self, namespace: &str, selector: &Selector) -> Result<Vec<Pod>> {
        list(self.api(namespace), selector).await
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        get_opt(self.api(namespace), name).await
    }

    async fn patch_pod(&self, namespace: &str, name: &str, patch: &Value) -> Result<()> {
        merge_patch::<Pod>(self.api(namespace), name, patch).await
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        get_opt(self.api(namespace), name).await
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<()> {
        create(self.api(namespace), service).await.map(|_| ())
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()> {
        delete::<Service>(self.api(namespace), name).await
    }

    async fn list_pvcs(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        list(self.api(namespace), selector).await
    }

    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        get_opt(self.api(namespace), name).await
    }

    async fn create_pvc(&self, namespace: &str, pvc: &PersistentVolumeClaim) -> Result<()> {
        create(self.api(namespace), pvc).await.map(|_| ())
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()> {
        delete::<PersistentVolumeClaim>(self.api(namespace), name).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        get_opt(self.api(namespace), name).await
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<()> {
        create(self.api(namespace), secret).await.map(|_| ())
    }

    async fn replace_secret(&self, namespace: &str, secret: &Secret) -> Result<()> {
        let api: Api<Secret> = self.api(namespace);
        let name = secret
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| crate::controller::Error::NotFound("secret name".to_string()))?;
        api.replace(name, &PostParams::default(), secret).await?;
        Ok(())
    }

    async fn get_configmap(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        get_opt(self.api(namespace), name).await
    }

    async fn create_configmap(&self, namespace: &str, config_map: &ConfigMap) -> Result<()> {
        create(self.api(namespace), config_map).await.map(|_| ())
    }

    async fn patch_configmap(&self, namespace: &str, name: &str, patch: &Value) -> Result<()> {
        merge_patch::<ConfigMap>(self.api(namespace), name, patch).await
    }

    async fn delete_configmap(&self, namespace: &str, name: &str) -> Result<()> {
        delete::<ConfigMap>(self.api(namespace), name).await
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<()> {
        create(self.api(namespace), job).await.map(|_| ())
    }

    async fn delete_jobs(&self, namespace: &str, selector: &Selector) -> Result<()> {
        let api: Api<Job> = self.api(namespace);
        api.delete_collection(&DeleteParams::background(), &list_params(selector))
            .await?;
        Ok(())
    }
}
