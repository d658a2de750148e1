use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};

use crate::env::{RAPI_CONNECT_TIMEOUT, RAPI_RESPONSE_TIMEOUT};
use crate::error::{RapiError, Result};

/// The remote control-plane API of a Ganeti cluster.
///
/// Mutating calls return the opaque identifier of the asynchronous job the
/// cluster accepted; the core never parses it and never waits for the job.
#[async_trait]
pub trait RapiClient: Send + Sync {
    async fn get_instances(&self, bulk: bool) -> Result<Value>;
    async fn query(&self, resource: &str, fields: &[&str], filter: Option<Value>) -> Result<Value>;
    async fn modify_instance(&self, instance: &str, params: Value) -> Result<String>;
    async fn shutdown_instance(&self, instance: &str) -> Result<String>;
    async fn startup_instance(&self, instance: &str) -> Result<String>;
    async fn reboot_instance(&self, instance: &str) -> Result<String>;
    async fn migrate_instance(&self, instance: &str) -> Result<String>;
    async fn rename_instance(
        &self,
        instance: &str,
        new_name: &str,
        ip_check: bool,
        name_check: bool,
    ) -> Result<String>;
    async fn delete_instance(&self, instance: &str) -> Result<String>;
    async fn create_instance(&self, body: Value) -> Result<String>;
    async fn reinstall_instance(&self, instance: &str, body: Value) -> Result<String>;
    async fn add_instance_tags(&self, instance: &str, tags: &[String]) -> Result<String>;
    async fn delete_instance_tags(&self, instance: &str, tags: &[String]) -> Result<String>;
    async fn get_cluster_tags(&self) -> Result<Vec<String>>;
    async fn get_nodes(&self, bulk: bool) -> Result<Value>;
    async fn get_groups(&self, bulk: bool) -> Result<Value>;
    async fn get_group(&self, group: &str) -> Result<Value>;
    async fn get_networks(&self, bulk: bool) -> Result<Value>;
    async fn get_info(&self) -> Result<Value>;
    async fn get_jobs(&self, bulk: bool) -> Result<Value>;
    async fn get_job_status(&self, job_id: &str) -> Result<Value>;
}

/// RAPI v2 client over HTTPS.
pub struct HttpRapiClient {
    client: Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

impl HttpRapiClient {
    pub fn new(
        hostname: &str,
        port: u16,
        username: Option<String>,
        password: Option<String>,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(*RAPI_CONNECT_TIMEOUT))
            .timeout(Duration::from_secs(*RAPI_RESPONSE_TIMEOUT))
            .build()?;
        Ok(HttpRapiClient {
            client,
            base_url: format!("https://{}:{}/2", hostname, port),
            username,
            password,
        })
    }

    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.request(method, url);
        if let Some(username) = &self.username {
            req = req.basic_auth(username, self.password.as_deref());
        }
        if let Some(body) = body {
            req = req.json(&body);
        }
        let res = req.send().await?;
        let status = res.status();
        if status == StatusCode::NOT_FOUND {
            return Err(RapiError::NotFound);
        }
        if !status.is_success() {
            let message = res.text().await.unwrap_or_default();
            return Err(RapiError::Api {
                code: status.as_u16(),
                message,
            });
        }
        Ok(res.json().await?)
    }

    async fn submit(&self, method: Method, path: &str, body: Option<Value>) -> Result<String> {
        let job = self.request(method, path, body).await?;
        Ok(job_id_string(&job))
    }
}

fn job_id_string(job: &Value) -> String {
    match job {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn bulk_suffix(bulk: bool) -> &'static str {
    if bulk {
        "?bulk=1"
    } else {
        ""
    }
}

fn tags_query(tags: &[String]) -> String {
    tags.iter()
        .map(|t| format!("tag={}", t))
        .collect::<Vec<_>>()
        .join("&")
}

#[async_trait]
impl RapiClient for HttpRapiClient {
    async fn get_instances(&self, bulk: bool) -> Result<Value> {
        self.request(
            Method::GET,
            &format!("/instances{}", bulk_suffix(bulk)),
            None,
        )
        .await
    }

    async fn query(&self, resource: &str, fields: &[&str], filter: Option<Value>) -> Result<Value> {
        let mut body = json!({ "fields": fields });
        if let Some(filter) = filter {
            body["qfilter"] = filter;
        }
        self.request(Method::PUT, &format!("/query/{}", resource), Some(body))
            .await
    }

    async fn modify_instance(&self, instance: &str, params: Value) -> Result<String> {
        self.submit(
            Method::PUT,
            &format!("/instances/{}/modify", instance),
            Some(params),
        )
        .await
    }

    async fn shutdown_instance(&self, instance: &str) -> Result<String> {
        self.submit(
            Method::PUT,
            &format!("/instances/{}/shutdown", instance),
            None,
        )
        .await
    }

    async fn startup_instance(&self, instance: &str) -> Result<String> {
        self.submit(
            Method::PUT,
            &format!("/instances/{}/startup", instance),
            None,
        )
        .await
    }

    async fn reboot_instance(&self, instance: &str) -> Result<String> {
        self.submit(
            Method::PUT,
            &format!("/instances/{}/reboot", instance),
            None,
        )
        .await
    }

    async fn migrate_instance(&self, instance: &str) -> Result<String> {
        self.submit(
            Method::PUT,
            &format!("/instances/{}/migrate", instance),
            None,
        )
        .await
    }

    async fn rename_instance(
        &self,
        instance: &str,
        new_name: &str,
        ip_check: bool,
        name_check: bool,
    ) -> Result<String> {
        self.submit(
            Method::PUT,
            &format!("/instances/{}/rename", instance),
            Some(json!({
                "new_name": new_name,
                "ip_check": ip_check,
                "name_check": name_check,
            })),
        )
        .await
    }

    async fn delete_instance(&self, instance: &str) -> Result<String> {
        self.submit(Method::DELETE, &format!("/instances/{}", instance), None)
            .await
    }

    async fn create_instance(&self, mut body: Value) -> Result<String> {
        body["__version__"] = json!(1);
        self.submit(Method::POST, "/instances", Some(body)).await
    }

    async fn reinstall_instance(&self, instance: &str, body: Value) -> Result<String> {
        self.submit(
            Method::POST,
            &format!("/instances/{}/reinstall", instance),
            Some(body),
        )
        .await
    }

    async fn add_instance_tags(&self, instance: &str, tags: &[String]) -> Result<String> {
        self.submit(
            Method::PUT,
            &format!("/instances/{}/tags?{}", instance, tags_query(tags)),
            None,
        )
        .await
    }

    async fn delete_instance_tags(&self, instance: &str, tags: &[String]) -> Result<String> {
        self.submit(
            Method::DELETE,
            &format!("/instances/{}/tags?{}", instance, tags_query(tags)),
            None,
        )
        .await
    }

    async fn get_cluster_tags(&self) -> Result<Vec<String>> {
        let tags = self.request(Method::GET, "/tags", None).await?;
        Ok(tags
            .as_array()
            .map(|ts| {
                ts.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_nodes(&self, bulk: bool) -> Result<Value> {
        self.request(Method::GET, &format!("/nodes{}", bulk_suffix(bulk)), None)
            .await
    }

    async fn get_groups(&self, bulk: bool) -> Result<Value> {
        self.request(Method::GET, &format!("/groups{}", bulk_suffix(bulk)), None)
            .await
    }

    async fn get_group(&self, group: &str) -> Result<Value> {
        self.request(Method::GET, &format!("/groups/{}", group), None)
            .await
    }

    async fn get_networks(&self, bulk: bool) -> Result<Value> {
        self.request(
            Method::GET,
            &format!("/networks{}", bulk_suffix(bulk)),
            None,
        )
        .await
    }

    async fn get_info(&self) -> Result<Value> {
        self.request(Method::GET, "/info", None).await
    }

    async fn get_jobs(&self, bulk: bool) -> Result<Value> {
        self.request(Method::GET, &format!("/jobs{}", bulk_suffix(bulk)), None)
            .await
    }

    async fn get_job_status(&self, job_id: &str) -> Result<Value> {
        self.request(Method::GET, &format!("/jobs/{}", job_id), None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_keep_their_wire_form() {
        assert_eq!(job_id_string(&json!(12345)), "12345");
        assert_eq!(job_id_string(&json!("12345")), "12345");
    }

    #[test]
    fn tag_query_joins_tags() {
        let tags = vec!["gnt:adminlock".to_owned(), "gnt:isolate".to_owned()];
        assert_eq!(tags_query(&tags), "tag=gnt:adminlock&tag=gnt:isolate");
    }
}
