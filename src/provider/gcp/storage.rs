//! Cloud Storage buckets

use async_trait::async_trait;
use serde::Serialize;

use super::GcpProvider;
use crate::provider::BucketStore;
use crate::resource::{Bucket, BucketName, ResourceKind};
use crate::Result;

#[derive(Serialize)]
struct InsertBucket<'a> {
    name: &'a str,
    location: &'a str,
}

#[async_trait]
impl BucketStore for GcpProvider {
    async fn get_bucket(&self, name: &BucketName) -> Result<Option<Bucket>> {
        let url = format!("{}/b/{}", self.endpoints.storage, name);
        self.lookup(ResourceKind::Bucket, name.as_str(), &url).await
    }

    async fn create_bucket(
        &self,
        project: &str,
        name: &BucketName,
        location: &str,
    ) -> Result<Bucket> {
        let url = format!("{}/b", self.endpoints.storage);
        self.create(
            ResourceKind::Bucket,
            name.as_str(),
            &url,
            &[("project", project)],
            &InsertBucket {
                name: name.as_str(),
                location,
            },
        )
        .await
    }
}
