use futures::FutureExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use u2f_hid::DeviceFactory;

use crate::apdu::{RegisterRequest, SignRequest};
use crate::config::ClientConfig;
use crate::coordinator::Coordinator;
use crate::error::Error;
use crate::operation::{self, ApduOperations, KeyOperations, RegisterResult, SignResult};

/// Registers and signs with whichever connected key answers first.
pub struct Client<F, O = ApduOperations> {
    factory: Arc<F>,
    operations: Arc<O>,
    config: ClientConfig,
}

impl<F: DeviceFactory> Client<F, ApduOperations> {
    pub fn new(factory: F, config: ClientConfig) -> Client<F, ApduOperations> {
        Client::with_operations(factory, ApduOperations, config)
    }
}

impl<F: DeviceFactory, O: KeyOperations> Client<F, O> {
    pub fn with_operations(factory: F, operations: O, config: ClientConfig) -> Client<F, O> {
        Client {
            factory: Arc::new(factory),
            operations: Arc::new(operations),
            config,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Register with the first key the user touches.
    pub async fn register(
        &self,
        requests: Vec<RegisterRequest>,
        cancel: CancellationToken,
    ) -> Result<RegisterResult, Error> {
        if requests.is_empty() {
            return Err(Error::NoRequests);
        }
        let requests = Arc::new(requests);
        let factory = self.factory.clone();
        let operations = self.operations.clone();
        let config = self.config.clone();

        let result = Coordinator::new(self.factory.clone(), &self.config)
            .run(
                move |identity, cancel| {
                    let factory = factory.clone();
                    let operations = operations.clone();
                    let requests = requests.clone();
                    let config = config.clone();
                    async move {
                        operation::register(
                            &*factory,
                            &identity,
                            &*operations,
                            &requests,
                            &config,
                            &cancel,
                        )
                        .await
                    }
                    .boxed()
                },
                RegisterResult::is_success,
                cancel,
            )
            .await?;
        info!(request = ?result.request, "Registration complete");
        Ok(result)
    }

    /// Sign with the first key that recognizes one of the key handles and is touched.
    pub async fn sign(
        &self,
        requests: Vec<SignRequest>,
        cancel: CancellationToken,
    ) -> Result<SignResult, Error> {
        if requests.is_empty() {
            return Err(Error::NoRequests);
        }
        let requests = Arc::new(requests);
        let factory = self.factory.clone();
        let operations = self.operations.clone();
        let config = self.config.clone();

        let result = Coordinator::new(self.factory.clone(), &self.config)
            .run(
                move |identity, cancel| {
                    let factory = factory.clone();
                    let operations = operations.clone();
                    let requests = requests.clone();
                    let config = config.clone();
                    async move {
                        operation::sign(
                            &*factory,
                            &identity,
                            &*operations,
                            &requests,
                            &config,
                            &cancel,
                        )
                        .await
                    }
                    .boxed()
                },
                SignResult::is_success,
                cancel,
            )
            .await?;
        info!(key_handle = ?result.request.key_handle, "Signing complete");
        Ok(result)
    }
}
