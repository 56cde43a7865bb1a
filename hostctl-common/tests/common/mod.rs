//! Shared fixtures for hostctl-common integration tests.

#![allow(dead_code)]

use hostctl_common::mock::{MockConnector, MockPlatform};
use hostctl_common::testing::init_test_logging;
use hostctl_common::{Endpoint, HostStateController, HostTimeouts, Session};
use std::sync::Arc;

pub const INITIAL_PROMPT: &str = r".*controller-[01]:~\$ ";
pub const PROMPT_TEMPLATE: &str = r".*{host}:~\$ ";

/// Connected controller on `platform`, plus the connector behind it so
/// tests can sever connections.
pub async fn controller_on(platform: &MockPlatform) -> (HostStateController, Arc<MockConnector>) {
    init_test_logging();
    let connector = Arc::new(platform.connector());
    let session = Session::open(
        Endpoint::mock("lab"),
        platform.credentials(),
        INITIAL_PROMPT,
        connector.clone(),
        Default::default(),
    )
    .await
    .expect("session to mock lab");

    let controller = HostStateController::new(session, HostTimeouts::default())
        .with_prompt_template(PROMPT_TEMPLATE)
        .expect("valid template");
    (controller, connector)
}
