//! Authenticated API session with an explicit readiness state machine.
//!
//! A session moves `Disconnected → Connecting → Ready` exactly once. The
//! bootstrap (service content, login, datacenter lookup) either completes or
//! leaves the session `Failed` for good. Concurrent `connect` calls wait
//! for the running handshake and share its outcome.

use std::sync::{Arc, Mutex, RwLock};

use crate::collector::{self, PropertyValue};
use crate::config::CollectorOptions;
use crate::error::{Error, Result};
use crate::moref::ManagedObjectRef;
use crate::soap::{Transport, XmlNode};

/// Well-known objects returned by `RetrieveServiceContent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceContent {
    pub root_folder: ManagedObjectRef,
    pub property_collector: ManagedObjectRef,
    pub view_manager: ManagedObjectRef,
    pub session_manager: ManagedObjectRef,
}

impl ServiceContent {
    fn from_node(node: &XmlNode) -> Result<Self> {
        let get = |name: &str| {
            node.child(name)
                .and_then(ManagedObjectRef::from_node)
                .ok_or_else(|| Error::not_found(format!("service content field {}", name)))
        };
        Ok(Self {
            root_folder: get("rootFolder")?,
            property_collector: get("propertyCollector")?,
            view_manager: get("viewManager")?,
            session_manager: get("sessionManager")?,
        })
    }
}

#[derive(Debug)]
struct Ready {
    service: ServiceContent,
    datacenter: String,
}

#[derive(Debug)]
enum SessionState {
    Disconnected,
    Connecting,
    Ready(Arc<Ready>),
    Failed(String),
}

/// One logical session per host connection.
pub struct Session<T> {
    transport: T,
    user: String,
    password: String,
    collector: CollectorOptions,
    state: RwLock<SessionState>,
    /// Held for the whole bootstrap so only one handshake runs.
    handshake: Mutex<()>,
}

impl<T: Transport> Session<T> {
    /// Wrap a transport; nothing is sent until [`Session::connect`].
    pub fn new(
        transport: T,
        user: impl Into<String>,
        password: impl Into<String>,
        collector: CollectorOptions,
    ) -> Self {
        Self {
            transport,
            user: user.into(),
            password: password.into(),
            collector,
            state: RwLock::new(SessionState::Disconnected),
            handshake: Mutex::new(()),
        }
    }

    /// Run the handshake. Idempotent once ready; terminal once failed.
    pub fn connect(&self) -> Result<()> {
        let _handshake = self.handshake.lock().unwrap_or_else(|e| e.into_inner());
        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            match &*state {
                SessionState::Ready(_) => return Ok(()),
                SessionState::Failed(message) => {
                    return Err(Error::SessionFailed {
                        message: message.clone(),
                    })
                }
                // a panicked handshake left this behind; start over
                SessionState::Connecting | SessionState::Disconnected => {
                    *state = SessionState::Connecting
                }
            }
        }

        let outcome = self.bootstrap();

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        match outcome {
            Ok(ready) => {
                tracing::info!(datacenter = %ready.datacenter, "session ready");
                *state = SessionState::Ready(Arc::new(ready));
                Ok(())
            }
            Err(error) => {
                let message = error.to_string();
                tracing::error!(%message, "session bootstrap failed");
                *state = SessionState::Failed(message.clone());
                Err(Error::SessionFailed { message })
            }
        }
    }

    fn bootstrap(&self) -> Result<Ready> {
        let instance = ManagedObjectRef::new("ServiceInstance", "ServiceInstance");
        let response = self
            .transport
            .call("RetrieveServiceContent", &[instance.to_node("_this")])?;
        let service = response
            .child("returnval")
            .ok_or_else(|| Error::not_found("service content"))
            .and_then(ServiceContent::from_node)?;

        self.transport.call(
            "Login",
            &[
                service.session_manager.to_node("_this"),
                XmlNode::leaf("userName", &self.user),
                XmlNode::leaf("password", &self.password),
            ],
        )?;
        tracing::debug!(user = %self.user, "logged in");

        let datacenters = collector::retrieve(
            |method, args| self.transport.call(method, args),
            &service,
            "Datacenter",
            &["name"],
            self.collector,
        )?;
        let datacenter = datacenters
            .values()
            .find_map(|props| props.get("name").and_then(PropertyValue::as_str))
            .ok_or_else(|| Error::not_found("datacenter"))?
            .to_string();

        Ok(Ready {
            service,
            datacenter,
        })
    }

    fn ready(&self, operation: &str) -> Result<Arc<Ready>> {
        match &*self.state.read().unwrap_or_else(|e| e.into_inner()) {
            SessionState::Ready(ready) => Ok(Arc::clone(ready)),
            SessionState::Failed(message) => Err(Error::SessionFailed {
                message: message.clone(),
            }),
            _ => Err(Error::not_ready(operation)),
        }
    }

    /// True once the handshake completed.
    pub fn is_ready(&self) -> bool {
        matches!(
            *self.state.read().unwrap_or_else(|e| e.into_inner()),
            SessionState::Ready(_)
        )
    }

    /// Send one command. Fails fast unless the session is ready.
    pub fn execute(&self, command: &str, args: &[XmlNode]) -> Result<XmlNode> {
        self.ready(command)?;
        tracing::debug!(command, "execute");
        self.transport.call(command, args)
    }

    /// Name of the datacenter resolved during the handshake.
    pub fn datacenter_path(&self) -> Result<String> {
        Ok(self.ready("resolve datacenter")?.datacenter.clone())
    }

    /// Service content captured during the handshake.
    pub fn service_content(&self) -> Result<ServiceContent> {
        Ok(self.ready("read service content")?.service.clone())
    }

    /// Property collector bounds this session was built with.
    pub fn collector_options(&self) -> CollectorOptions {
        self.collector
    }

    /// The API session cookie held by the transport.
    pub fn session_cookie(&self) -> Option<String> {
        self.transport.session_cookie()
    }
}
