//! Shared fixture for device scenario tests
#![allow(dead_code)]

use std::rc::Rc;

use weave_core::cloud::CloudOptions;
use weave_core::provider::ConnectionState;
use weave_core::{Device, Providers, Settings, Timestamp};
use weave_harness::{
    FakeClock, FakeDnsServiceDiscovery, FakeHttpClient, FakeHttpServer, FakeNetwork,
    FakeTaskRunner, FakeWifi, MemoryConfigStore,
};

pub const SERVICE_URL: &str = "https://cloud.example.com/v1/";
pub const OAUTH_URL: &str = "https://accounts.example.com/o/oauth2/token";

pub struct Fixture {
    pub clock: FakeClock,
    pub runner: FakeTaskRunner,
    pub store: Rc<MemoryConfigStore>,
    pub http: FakeHttpClient,
    pub network: FakeNetwork,
    pub dns_sd: FakeDnsServiceDiscovery,
    pub wifi: FakeWifi,
    pub device: Device,
}

pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.client_id = "TEST_CLIENT_ID".into();
    settings.client_secret = "TEST_CLIENT_SECRET".into();
    settings.api_key = "TEST_API_KEY".into();
    settings.oauth_url = OAUTH_URL.into();
    settings.service_url = SERVICE_URL.into();
    settings.name = "TEST_NAME".into();
    settings.model_id = "ABCDE".into();
    settings.firmware_version = "TEST_FIRMWARE".into();
    settings
}

pub fn fixture(settings: Settings, network_state: ConnectionState) -> Fixture {
    let clock = FakeClock::new(Timestamp::from_secs(1_700_000_000));
    let runner = FakeTaskRunner::new(clock.clone());
    let store = Rc::new(MemoryConfigStore::new());
    let http = FakeHttpClient::new(runner.clone());
    let network = FakeNetwork::new(runner.clone(), network_state);
    let dns_sd = FakeDnsServiceDiscovery::new();
    let wifi = FakeWifi::new(clock.clone());

    let providers = Providers {
        task_runner: Rc::new(runner.clone()),
        clock: Rc::new(clock.clone()),
        config_store: store.clone(),
        http_client: Rc::new(http.clone()),
        network: Some(Rc::new(network.clone())),
        dns_sd: Some(Rc::new(dns_sd.clone())),
        http_server: Some(Rc::new(FakeHttpServer::new())),
        wifi: Some(Rc::new(wifi.clone())),
    };
    let device = Device::new(settings, CloudOptions::default(), providers);

    Fixture {
        clock,
        runner,
        store,
        http,
        network,
        dns_sd,
        wifi,
        device,
    }
}
