//! Integration tests for the session handshake and property collector.

mod common;

use common::{connected, datastore_object, fast_config, object, xml, FakeBackend, FakeTransport};
use esxi_core::config::CollectorOptions;
use esxi_core::http::HttpResponse;
use esxi_core::{CancelToken, Error, Esxi, ManagedObjectRef, PropertyValue};

fn no_files() -> FakeBackend {
    FakeBackend::new(|_, _| Ok(HttpResponse::from_bytes(404, Vec::new())))
}

#[test]
fn test_connect_resolves_datacenter() {
    let esxi = connected(FakeTransport::new(), no_files());
    assert!(esxi.session().is_ready());
    assert_eq!(esxi.session().datacenter_path().unwrap(), "ha-datacenter");
}

#[test]
fn test_connect_is_idempotent() {
    let transport = FakeTransport::new();
    let calls = transport.calls.clone();
    let esxi = connected(transport, no_files());

    let before = calls.lock().unwrap().len();
    esxi.connect().expect("Second connect should succeed");
    assert_eq!(calls.lock().unwrap().len(), before);
}

#[test]
fn test_execute_before_ready_fails_fast() {
    let transport = FakeTransport::new();
    let calls = transport.calls.clone();
    let esxi = Esxi::with_parts(fast_config(), transport, no_files());

    let err = esxi.session().execute("PowerOnVM_Task", &[]).unwrap_err();
    assert!(matches!(err, Error::NotReady { .. }));
    assert!(matches!(esxi.search("VirtualMachine", &["name"]), Err(Error::NotReady { .. })));
    assert!(matches!(
        esxi.download("datastore1", "web/web.vmx", None, &CancelToken::never()),
        Err(Error::NotReady { .. })
    ));
    assert!(calls.lock().unwrap().is_empty(), "no request may be sent before ready");
}

#[test]
fn test_failed_bootstrap_is_terminal() {
    let transport = FakeTransport::new().with_override("Login", |_| {
        Err(Error::Rpc {
            method: "Login".to_string(),
            fault: "Cannot complete login due to an incorrect user name or password.".to_string(),
        })
    });
    let calls = transport.calls.clone();
    let esxi = Esxi::with_parts(fast_config(), transport, no_files());

    let err = esxi.connect().unwrap_err();
    assert!(matches!(err, Error::SessionFailed { .. }));
    assert!(err.to_string().contains("incorrect user name"));

    let sent = calls.lock().unwrap().len();
    assert!(matches!(esxi.connect(), Err(Error::SessionFailed { .. })));
    assert!(matches!(
        esxi.session().execute("Fetch", &[]),
        Err(Error::SessionFailed { .. })
    ));
    assert_eq!(calls.lock().unwrap().len(), sent, "a failed session is not retried");
}

#[test]
fn test_missing_datacenter_fails_bootstrap() {
    let mut transport = FakeTransport::new();
    transport.set_pages("Datacenter", Vec::new());
    let esxi = Esxi::with_parts(fast_config(), transport, no_files());
    assert!(matches!(esxi.connect(), Err(Error::SessionFailed { .. })));
}

#[test]
fn test_search_merges_pages() {
    let mut transport = FakeTransport::new();
    transport.set_pages(
        "Datastore",
        vec![
            datastore_object("datastore-1", "datastore1", "ds:///vmfs/volumes/5f1a-01/"),
            datastore_object("datastore-2", "fast", "ds:///vmfs/volumes/5f1a-02/"),
            datastore_object("datastore-3", "archive", "ds:///vmfs/volumes/5f1a-03/"),
        ],
    );
    let calls = transport.calls.clone();
    let esxi = connected(transport, no_files());

    let found = esxi.search("Datastore", &["summary"]).expect("Search should succeed");
    assert_eq!(found.len(), 3);
    let summary = found[&ManagedObjectRef::new("Datastore", "datastore-2")]["summary"]
        .as_node()
        .expect("summary is a structure");
    assert_eq!(summary.text_at(&["name"]), Some("fast"));

    assert_eq!(FakeTransport::calls_to(&calls, "ContinueRetrievePropertiesEx"), 2);
    // one view for the datacenter lookup, one for this search
    assert_eq!(FakeTransport::calls_to(&calls, "DestroyView"), 2);
}

#[test]
fn test_search_unwraps_scalars() {
    let transport = FakeTransport::new().with_objects(
        "VirtualMachine",
        vec![object("VirtualMachine", "12", &[("name", "<val xsi:type=\"xsd:string\">web</val>")])],
    );
    let esxi = connected(transport, no_files());

    let found = esxi.search("VirtualMachine", &["name"]).unwrap();
    assert_eq!(
        found[&ManagedObjectRef::new("VirtualMachine", "12")]["name"],
        PropertyValue::Scalar("web".to_string())
    );
}

#[test]
fn test_search_empty_result() {
    let esxi = connected(FakeTransport::new(), no_files());
    let found = esxi.search("VirtualMachine", &["name"]).expect("Empty search should succeed");
    assert!(found.is_empty());
}

#[test]
fn test_pagination_is_bounded() {
    let mut transport = FakeTransport::new();
    transport.set_pages(
        "VirtualMachine",
        (0..5)
            .map(|i| object("VirtualMachine", &i.to_string(), &[]))
            .collect(),
    );
    let calls = transport.calls.clone();
    let config = fast_config().with_collector(CollectorOptions { max_pages: 3 });
    let esxi = Esxi::with_parts(config, transport, no_files());
    esxi.connect().unwrap();

    let err = esxi.search("VirtualMachine", &["name"]).unwrap_err();
    assert!(matches!(err, Error::PaginationLimit { pages: 3, .. }));
    assert_eq!(FakeTransport::calls_to(&calls, "ContinueRetrievePropertiesEx"), 2);
}

#[test]
fn test_destroy_view_failure_is_not_surfaced() {
    let transport = FakeTransport::new().with_override("DestroyView", |_| {
        Err(Error::Rpc {
            method: "DestroyView".to_string(),
            fault: "ManagedObjectNotFound".to_string(),
        })
    });
    let esxi = connected(transport, no_files());
    assert!(esxi.search("VirtualMachine", &["name"]).is_ok());
}

#[test]
fn test_rpc_fault_is_surfaced() {
    let transport = FakeTransport::new().with_override("PowerOnVM_Task", |_| {
        Err(Error::Rpc {
            method: "PowerOnVM_Task".to_string(),
            fault: "InvalidPowerState".to_string(),
        })
    });
    let esxi = connected(transport, no_files());
    let err = esxi.power_on("12").unwrap_err();
    assert!(err.to_string().contains("InvalidPowerState"));
}

#[test]
fn test_power_returns_task() {
    let transport = FakeTransport::new().with_override("PowerOffVM_Task", |args| {
        assert_eq!(args[0].attr("type"), Some("VirtualMachine"));
        assert_eq!(args[0].text, "12");
        Ok(xml("<PowerOffVM_TaskResponse><returnval type=\"Task\">haTask-12-vim.VirtualMachine.powerOff-1</returnval></PowerOffVM_TaskResponse>"))
    });
    let esxi = connected(transport, no_files());
    let task = esxi.power_off("12").expect("Power off should start");
    assert_eq!(task.kind, "Task");
}

#[test]
fn test_concurrent_connects_share_one_handshake() {
    let transport = FakeTransport::new().with_override("Login", |_| {
        std::thread::sleep(std::time::Duration::from_millis(100));
        Ok(xml("<LoginResponse><returnval><key>52a9</key></returnval></LoginResponse>"))
    });
    let calls = transport.calls.clone();
    let esxi = Esxi::with_parts(fast_config(), transport, no_files());

    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..3).map(|_| scope.spawn(|| esxi.connect())).collect();
        for handle in handles {
            handle.join().unwrap().expect("Every caller should see the ready session");
        }
    });
    assert!(esxi.session().is_ready());
    assert_eq!(FakeTransport::calls_to(&calls, "Login"), 1);
}

#[test]
fn test_concurrent_connects_share_a_failure() {
    let transport = FakeTransport::new().with_override("Login", |_| {
        std::thread::sleep(std::time::Duration::from_millis(100));
        Err(Error::Rpc {
            method: "Login".to_string(),
            fault: "InvalidLogin".to_string(),
        })
    });
    let calls = transport.calls.clone();
    let esxi = Esxi::with_parts(fast_config(), transport, no_files());

    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..3).map(|_| scope.spawn(|| esxi.connect())).collect();
        for handle in handles {
            let err = handle.join().unwrap().unwrap_err();
            assert!(matches!(err, Error::SessionFailed { .. }), "got {err}");
        }
    });
    assert_eq!(FakeTransport::calls_to(&calls, "Login"), 1);
}
