//! Bearer-token minting for database access
//!
//! The ArangoDB servers accept JWTs signed with the deployment's shared
//! token secret. Every probe mints a fresh token; tokens are never cached.

use std::sync::Arc;

use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use kube::ResourceExt;
#[cfg(test)]
use mockall::automock;
use serde::Serialize;

use crate::crd::ArangoDeployment;
use crate::gateway::ClusterGateway;
use crate::{Error, Result, TOKEN_ISSUER, TOKEN_SERVER_ID};

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    server_id: &'a str,
}

/// Produces bearer tokens for a deployment's database endpoint
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Mint a fresh bearer token for the given deployment
    async fn bearer_token(&self, namespace: &str, deployment: &ArangoDeployment)
        -> Result<String>;
}

/// Issuer signing HS256 tokens with the deployment's JWT secret
pub struct JwtIssuer {
    gateway: Arc<dyn ClusterGateway>,
}

impl JwtIssuer {
    /// Create an issuer reading secrets through the given gateway
    pub fn new(gateway: Arc<dyn ClusterGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl TokenIssuer for JwtIssuer {
    async fn bearer_token(
        &self,
        namespace: &str,
        deployment: &ArangoDeployment,
    ) -> Result<String> {
        let name = deployment.name_any();
        let secret_name = deployment
            .spec
            .authentication
            .secret_name()
            .ok_or_else(|| Error::token(format!("deployment {name} has no jwt secret name")))?;

        let secret = self.gateway.token_secret(namespace, secret_name).await?;
        sign_bearer_token(&secret)
    }
}

/// Sign the fixed chaos-agent claims with the given shared secret
pub fn sign_bearer_token(secret: &[u8]) -> Result<String> {
    let claims = Claims {
        iss: TOKEN_ISSUER,
        server_id: TOKEN_SERVER_ID,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret),
    )
    .map_err(|e| Error::token(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{AuthenticationSpec, DeploymentSpec};
    use crate::gateway::MockClusterGateway;
    use jsonwebtoken::{decode, DecodingKey, Validation};
    use mockall::predicate::eq;

    fn decode_claims(token: &str, secret: &[u8]) -> serde_json::Value {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        validation.validate_exp = false;
        decode::<serde_json::Value>(token, &DecodingKey::from_secret(secret), &validation)
            .expect("token verifies against the signing secret")
            .claims
    }

    /// The servers identify the agent by the fixed issuer and server-id
    /// claims; both must survive the round trip through signing.
    #[test]
    fn signed_token_carries_the_chaos_claims() {
        let secret = b"super-secret-signing-key";
        let token = sign_bearer_token(secret).unwrap();
        let claims = decode_claims(&token, secret);

        assert_eq!(claims["iss"], "arangodb");
        assert_eq!(claims["server_id"], "CHAOS!!!!!");
    }

    #[test]
    fn token_does_not_verify_with_another_secret() {
        let token = sign_bearer_token(b"secret-a").unwrap();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        validation.validate_exp = false;
        let result =
            decode::<serde_json::Value>(&token, &DecodingKey::from_secret(b"secret-b"), &validation);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn issuer_reads_the_deployment_jwt_secret() {
        let mut gateway = MockClusterGateway::new();
        gateway
            .expect_token_secret()
            .with(eq("db"), eq("db-jwt"))
            .times(1)
            .returning(|_, _| Ok(b"shared".to_vec()));

        let deployment = ArangoDeployment::new(
            "db",
            DeploymentSpec {
                authentication: AuthenticationSpec {
                    jwt_secret_name: Some("db-jwt".to_string()),
                },
                ..DeploymentSpec::default()
            },
        );

        let issuer = JwtIssuer::new(Arc::new(gateway));
        let token = issuer.bearer_token("db", &deployment).await.unwrap();
        assert_eq!(decode_claims(&token, b"shared")["iss"], "arangodb");
    }

    #[tokio::test]
    async fn issuer_fails_without_a_jwt_secret_reference() {
        let gateway = MockClusterGateway::new();
        let deployment = ArangoDeployment::new("db", DeploymentSpec::default());

        let issuer = JwtIssuer::new(Arc::new(gateway));
        let result = issuer.bearer_token("db", &deployment).await;
        assert!(matches!(result.unwrap_err(), Error::Token(_)));
    }
}
