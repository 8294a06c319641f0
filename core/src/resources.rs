//! Typed descriptors for the dashboard's REST resources.
//!
//! Each operation is a function returning a `RequestDescriptor`, and reads
//! come with the `CacheKey` that writes must invalidate.

/// Session login/logout.
pub mod session {
    use crate::descriptor::RequestDescriptor;
    use crate::error::DescriptorError;
    use crate::types::Credentials;

    pub fn login(credentials: &Credentials) -> Result<RequestDescriptor, DescriptorError> {
        RequestDescriptor::post("/session").json(credentials).build()
    }

    pub fn logout() -> Result<RequestDescriptor, DescriptorError> {
        RequestDescriptor::delete("/session").build()
    }
}

/// `/clients` CRUD.
pub mod clients {
    use uuid::Uuid;

    use crate::descriptor::{CacheKey, InvalidationSet, RequestDescriptor};
    use crate::error::DescriptorError;
    use crate::types::{CreateClient, UpdateClient};

    pub fn key() -> CacheKey {
        CacheKey::new("clients")
    }

    pub fn item_key(id: Uuid) -> CacheKey {
        CacheKey::new(&format!("clients/{id}"))
    }

    pub fn list() -> Result<RequestDescriptor, DescriptorError> {
        RequestDescriptor::get("/clients").build()
    }

    pub fn get(id: Uuid) -> Result<RequestDescriptor, DescriptorError> {
        RequestDescriptor::get(&format!("/clients/{id}")).build()
    }

    pub fn create(input: &CreateClient) -> Result<RequestDescriptor, DescriptorError> {
        RequestDescriptor::post("/clients").json(input).build()
    }

    pub fn update(id: Uuid, input: &UpdateClient) -> Result<RequestDescriptor, DescriptorError> {
        RequestDescriptor::put(&format!("/clients/{id}")).json(input).build()
    }

    pub fn delete(id: Uuid) -> Result<RequestDescriptor, DescriptorError> {
        RequestDescriptor::delete(&format!("/clients/{id}")).build()
    }

    /// Keys a write to client `id` makes stale.
    pub fn affected_by_write(id: Option<Uuid>) -> InvalidationSet {
        let set = InvalidationSet::new().with(key());
        match id {
            Some(id) => set.with(item_key(id)),
            None => set,
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::http::HttpMethod;
    use crate::types::{CreateClient, Credentials, UpdateClient};

    const BASE_URL: &str = "http://localhost:3000";

    #[test]
    fn list_produces_correct_request() {
        let descriptor = clients::list().unwrap();
        let request = descriptor.to_http_request(BASE_URL).unwrap();
        assert_eq!(request.method, HttpMethod::Get);
        assert_eq!(request.url, "http://localhost:3000/clients");
        assert!(request.body.is_none());
        assert_eq!(descriptor.cache_key(), clients::key());
    }

    #[test]
    fn get_keys_by_id() {
        let id = Uuid::nil();
        let descriptor = clients::get(id).unwrap();
        assert_eq!(
            descriptor.to_http_request(BASE_URL).unwrap().url,
            "http://localhost:3000/clients/00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(descriptor.cache_key(), clients::item_key(id));
    }

    #[test]
    fn create_is_a_non_retryable_post_with_json() {
        let input = CreateClient {
            name: "Acme".to_string(),
            email: None,
            company: Some("Acme Ltd".to_string()),
        };
        let descriptor = clients::create(&input).unwrap();
        assert_eq!(descriptor.method(), HttpMethod::Post);
        assert!(!descriptor.retryable());
        let body: serde_json::Value = serde_json::from_str(descriptor.body().unwrap()).unwrap();
        assert_eq!(body["name"], "Acme");
        assert_eq!(body["company"], "Acme Ltd");
        assert!(body.get("email").is_none());
    }

    #[test]
    fn update_omits_unset_fields() {
        let input = UpdateClient {
            email: Some("ops@acme.test".to_string()),
            ..UpdateClient::default()
        };
        let descriptor = clients::update(Uuid::nil(), &input).unwrap();
        assert_eq!(descriptor.method(), HttpMethod::Put);
        let body: serde_json::Value = serde_json::from_str(descriptor.body().unwrap()).unwrap();
        assert_eq!(body, serde_json::json!({"email": "ops@acme.test"}));
    }

    #[test]
    fn delete_has_no_body() {
        let descriptor = clients::delete(Uuid::nil()).unwrap();
        assert_eq!(descriptor.method(), HttpMethod::Delete);
        assert!(descriptor.body().is_none());
    }

    #[test]
    fn writes_invalidate_list_and_item() {
        let id = Uuid::new_v4();
        let set = clients::affected_by_write(Some(id));
        assert!(set.contains(&clients::key()));
        assert!(set.contains(&clients::item_key(id)));
        assert_eq!(clients::affected_by_write(None).len(), 1);
    }

    #[test]
    fn login_posts_credentials() {
        let descriptor = session::login(&Credentials {
            username: "admin".into(),
            password: "secret".into(),
        })
        .unwrap();
        assert_eq!(descriptor.endpoint(), "/session");
        assert_eq!(descriptor.method(), HttpMethod::Post);
    }
}
