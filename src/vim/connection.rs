use std::sync::Arc;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use super::{unbox, value_at, ApiError, ManagedObjectRef, ManagementApi, ObjectContent, PropertyFilterSpec, RetrieveResult, ServiceContent};

/// A named connection to one management server
#[derive(Clone)]
pub struct Connection {
    name: String,
    api: Arc<dyn ManagementApi>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("name", &self.name).finish()
    }
}

impl Connection {
    pub fn new(name: impl Into<String>, api: Arc<dyn ManagementApi>) -> Self {
        Self {
            name: name.into(),
            api,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn api(&self) -> &Arc<dyn ManagementApi> {
        &self.api
    }

    pub fn content(&self) -> &ServiceContent {
        self.api.service_content()
    }

    pub fn root_folder(&self) -> &ManagedObjectRef {
        &self.content().root_folder
    }

    /// Read a possibly dotted property path. Missing leaves come back as `Null`.
    pub async fn get(&self, obj: &ManagedObjectRef, path: &str) -> Result<Value, ApiError> {
        let (head, rest) = path.split_once('.').unwrap_or((path, ""));
        let top = unbox(self.api.property(obj, head).await?);
        Ok(value_at(&top, rest).cloned().unwrap_or(Value::Null))
    }

    pub async fn get_as<T: DeserializeOwned>(&self, obj: &ManagedObjectRef, path: &str) -> Result<T, ApiError> {
        let value = self.get(obj, path).await?;
        serde_json::from_value(value).map_err(|e| ApiError::Decode(format!("{}.{}: {}", obj, path, e)))
    }

    pub async fn get_str(&self, obj: &ManagedObjectRef, path: &str) -> Result<String, ApiError> {
        Ok(self.get(obj, path).await?.as_str().unwrap_or_default().to_string())
    }

    pub async fn name_of(&self, obj: &ManagedObjectRef) -> Result<String, ApiError> {
        self.get_str(obj, "name").await
    }

    /// Handles stored in an array property, e.g. `childEntity`
    pub async fn get_refs(&self, obj: &ManagedObjectRef, path: &str) -> Result<Vec<ManagedObjectRef>, ApiError> {
        match self.get(obj, path).await? {
            Value::Null => Ok(Vec::new()),
            value => serde_json::from_value(value).map_err(ApiError::from),
        }
    }

    pub async fn call(&self, obj: &ManagedObjectRef, method: &str, params: Value) -> Result<Value, ApiError> {
        log::debug!("{} {}.{}", self.name, obj, method);
        Ok(unbox(self.api.invoke(obj, method, params).await?))
    }

    /// Invoke a `*_Task` method and return the task handle
    pub async fn call_task(&self, obj: &ManagedObjectRef, method: &str, params: Value) -> Result<ManagedObjectRef, ApiError> {
        let result = self.call(obj, method, params).await?;
        serde_json::from_value(result).map_err(|e| ApiError::Decode(format!("{} did not return a task: {}", method, e)))
    }

    /// Fetch the same property paths for a set of objects in one round trip
    pub async fn retrieve(&self, objs: &[ManagedObjectRef], paths: &[&str]) -> Result<Vec<ObjectContent>, ApiError> {
        if objs.is_empty() {
            return Ok(Vec::new());
        }

        let collector = self.content().property_collector.clone();
        let spec = PropertyFilterSpec::for_objects(objs, paths);
        let first = self.call(&collector, "RetrievePropertiesEx", json!({
            "specSet": [spec],
            "options": {"_typeName": "RetrieveOptions"},
        })).await?;

        let mut page: RetrieveResult = match first {
            Value::Null => RetrieveResult::default(),
            value => serde_json::from_value(value)?,
        };
        let mut objects = std::mem::take(&mut page.objects);

        while let Some(token) = page.token.take() {
            let next = self.call(&collector, "ContinueRetrievePropertiesEx", json!({"token": token})).await?;
            page = serde_json::from_value(next)?;
            objects.append(&mut page.objects);
        }

        for object in &mut objects {
            for prop in &mut object.prop_set {
                prop.val = unbox(std::mem::take(&mut prop.val));
            }
        }
        Ok(objects)
    }

    /// One of the guest operations sub-managers (`fileManager`, `processManager`, `authManager`)
    pub async fn guest_manager(&self, which: &str) -> Result<ManagedObjectRef, ApiError> {
        let unsupported = || ApiError::fault("NotSupported", "This command requires vSphere 5 or greater");
        let manager = self.content().guest_operations_manager.clone().ok_or_else(unsupported)?;
        match self.get(&manager, which).await? {
            Value::Null => Err(unsupported()),
            value => Ok(serde_json::from_value(value)?),
        }
    }
}
