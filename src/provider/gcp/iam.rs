//! IAM service accounts

use async_trait::async_trait;
use serde::Serialize;

use super::GcpProvider;
use crate::provider::IdentityStore;
use crate::resource::{ResourceKind, ServiceAccount, ServiceAccountEmail};
use crate::Result;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateServiceAccountRequest<'a> {
    account_id: &'a str,
    service_account: ServiceAccountFields<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceAccountFields<'a> {
    display_name: &'a str,
}

#[async_trait]
impl IdentityStore for GcpProvider {
    async fn get_service_account(
        &self,
        email: &ServiceAccountEmail,
    ) -> Result<Option<ServiceAccount>> {
        // `-` lets IAM infer the project from the email
        let url = format!("{}/projects/-/serviceAccounts/{}", self.endpoints.iam, email);
        self.lookup(ResourceKind::ServiceAccount, email.as_str(), &url)
            .await
    }

    async fn create_service_account(
        &self,
        project: &str,
        account_id: &str,
        display_name: &str,
    ) -> Result<ServiceAccount> {
        let resource = ServiceAccountEmail::for_account(project, account_id)?;
        let url = format!("{}/projects/{}/serviceAccounts", self.endpoints.iam, project);
        self.create(
            ResourceKind::ServiceAccount,
            resource.as_str(),
            &url,
            &[],
            &CreateServiceAccountRequest {
                account_id,
                service_account: ServiceAccountFields { display_name },
            },
        )
        .await
    }
}
