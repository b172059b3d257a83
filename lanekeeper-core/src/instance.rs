//! The backend instance
//!
//! [`Instance`] ties the pieces together: it admits sessions onto lanes,
//! keeps them in the registry, and tears them down on close, interrupt or
//! reset. One instance is constructed per process and shared by `Arc`.

use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::InstanceConfig;
use crate::demand::ResourceDemand;
use crate::device::{
    AllocatorAttributes, CpuDeviceFactory, Device, DeviceContainer, DeviceKind, DeviceSpec,
};
use crate::engine::{ExecutionContext, ExecutionEngine, InterruptCallback};
use crate::error::{AdmissionError, ConfigError, DeviceError, SessionError};
use crate::events::{EventBus, InstanceEvent};
use crate::graph::{GraphDef, GraphValidator, SyntaxValidator};
use crate::lane::LaneManager;
use crate::session::{DeviceSet, Session, SessionConfig, SessionHandle, SessionRegistry};

/// Request to admit a new session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub graph_def: GraphDef,
    #[serde(default)]
    pub config: SessionConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_handle: SessionHandle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseSessionRequest {
    pub session_handle: SessionHandle,
}

/// Reserved; carries nothing yet
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListDevicesRequest {}

/// Reserved; carries nothing yet
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListDevicesResponse {}

pub struct Instance {
    config: InstanceConfig,
    engine: Arc<dyn ExecutionEngine>,
    event_bus: Arc<dyn EventBus>,
    validator: Arc<dyn GraphValidator>,
    lane_manager: LaneManager,
    devices: DeviceContainer,
    registry: Arc<SessionRegistry>,
}

impl Instance {
    /// Build an instance with the syntactic graph validator
    pub fn new(
        config: InstanceConfig,
        engine: Arc<dyn ExecutionEngine>,
        event_bus: Arc<dyn EventBus>,
    ) -> Result<Self, ConfigError> {
        Self::with_validator(config, engine, event_bus, Arc::new(SyntaxValidator))
    }

    pub fn with_validator(
        config: InstanceConfig,
        engine: Arc<dyn ExecutionEngine>,
        event_bus: Arc<dyn EventBus>,
        validator: Arc<dyn GraphValidator>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let cpus = CpuDeviceFactory::create_devices(&config.cpu);
        let companion = cpus
            .first()
            .cloned()
            .ok_or_else(|| ConfigError::Invalid("no CPU device configured".to_string()))?;
        let lane_manager = LaneManager::new(&config, companion);

        let mut devices = DeviceContainer::new();
        for (i, cpu) in cpus.into_iter().enumerate() {
            devices.add(DeviceSpec::cpu(i as u32), cpu);
        }
        for lane in lane_manager.lanes() {
            devices.add(DeviceSpec::gpu(lane.id()), lane.device().clone());
        }
        info!(
            lanes = lane_manager.lanes().len(),
            devices = devices.len(),
            "Instance ready"
        );

        Ok(Self {
            config,
            engine,
            event_bus,
            validator,
            lane_manager,
            devices,
            registry: Arc::new(SessionRegistry::new()),
        })
    }

    /// Admit a session under a freshly generated handle
    pub async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<CreateSessionResponse, AdmissionError> {
        self.create_session_with_handle(Uuid::new_v4().to_string(), request)
            .await
    }

    /// Admit a session under a caller-chosen handle
    ///
    /// Fails with `RegistrationConflict` when the handle is already live;
    /// the new session is released and the existing one is left alone.
    pub async fn create_session_with_handle(
        &self,
        handle: SessionHandle,
        request: CreateSessionRequest,
    ) -> Result<CreateSessionResponse, AdmissionError> {
        self.validator.validate(&request.graph_def)?;

        let mut context = self
            .engine
            .make_context()
            .ok_or(AdmissionError::EngineUnavailable)?;
        context.drop_exclusive_mode();

        let demand = ResourceDemand::extract(&request.config.resource_map, &self.config.demand);
        context.set_expected_running_time(demand.expected_runtime_ms);

        let lanes = match self.lane_manager.request_lanes(demand.to_layout()).await {
            Ok(lanes) => lanes,
            Err(e) => {
                self.discard(context);
                return Err(e.into());
            }
        };
        let Some(lane) = lanes.first().map(|lease| Arc::clone(lease.lane())) else {
            self.discard(context);
            return Err(AdmissionError::Internal(
                "lane manager granted no lanes".to_string(),
            ));
        };

        let devices = DeviceSet::new(
            self.lane_manager.compatible_cpu_device(),
            lanes.iter().map(|lease| {
                let device: Arc<dyn Device> = lease.lane().device().clone();
                device
            }),
        );

        context.set_lane_id(lane.id());
        let lane_avail = lane.available_memory();
        info!(
            sess = %handle,
            lane_id = lane.id(),
            lane_size = lane.total_memory(),
            lane_avail,
            lane_stream = lane.base_stream_index(),
            "lane_assigned"
        );
        context.set_lanes(lanes);

        let name = request.config.name.clone();
        let session = Arc::new(Session::new(
            handle.clone(),
            request.config,
            request.graph_def,
            devices,
            context,
            Arc::clone(&self.engine),
        ));

        if let Err(e) = self.registry.insert(handle.clone(), Arc::clone(&session)) {
            error!(sess = %handle, error = %e, "Error when inserting session");
            if let Err(close_err) = session.safe_close() {
                warn!(sess = %handle, error = %close_err, "Failed to release rejected session");
            }
            return Err(AdmissionError::RegistrationConflict(handle));
        }
        // interrupts that arrive before this point find no callback and are ignored
        if !session.set_interrupt_callback(self.interrupt_callback(handle.clone())) {
            debug!(sess = %handle, "Session closed before its interrupt callback was installed");
        }

        self.event_bus
            .publish(InstanceEvent::LaneAssigned {
                session_id: handle.clone(),
                lane_id: lane.id(),
                lane_size: lane.total_memory(),
                lane_avail,
                lane_stream: lane.base_stream_index(),
            })
            .await;
        self.event_bus
            .publish(InstanceEvent::SessionCreated {
                session_id: handle.clone(),
                name,
            })
            .await;

        Ok(CreateSessionResponse {
            session_handle: handle,
        })
    }

    /// Close a session once its in-flight tasks are done
    pub async fn close_session(&self, request: CloseSessionRequest) -> Result<(), SessionError> {
        let handle = request.session_handle;
        let session = self.registry.extract(&handle)?;
        session.defer_close().await?;
        info!(sess = %handle, "Session closed");

        self.event_bus
            .publish(InstanceEvent::SessionClosed { session_id: handle })
            .await;
        Ok(())
    }

    /// Drop every session
    ///
    /// All sessions are closed even when some fail; the first failure is
    /// returned.
    pub async fn reset(&self) -> Result<(), SessionError> {
        let sessions = self.registry.drain_all();
        let mut first_error = None;
        let mut failed = 0;

        for session in &sessions {
            if let Err(e) = session.safe_close() {
                warn!(sess = %session.handle(), error = %e, "Failed to close session during reset");
                failed += 1;
                first_error.get_or_insert(e);
            }
        }
        info!(closed = sessions.len() - failed, failed, "Instance reset");

        self.event_bus
            .publish(InstanceEvent::Reset {
                closed: sessions.len() - failed,
                failed,
            })
            .await;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Reserved; answers with an empty response
    pub fn list_devices(&self, _request: ListDevicesRequest) -> ListDevicesResponse {
        ListDevicesResponse::default()
    }

    pub fn find_session(&self, handle: &str) -> Result<Arc<Session>, SessionError> {
        Ok(self.registry.find(handle)?)
    }

    /// Remove a session from the registry without closing it
    pub fn pop_session(&self, handle: &str) -> Result<Arc<Session>, SessionError> {
        Ok(self.registry.extract(handle)?)
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    pub fn device(&self, spec: &DeviceSpec) -> Result<Arc<dyn Device>, DeviceError> {
        self.devices.lookup(spec)
    }

    pub fn devices(&self) -> &DeviceContainer {
        &self.devices
    }

    /// Memory map of a GPU device, when its allocator can describe itself
    pub fn dump_memory_map(&self, device: &dyn Device) -> Option<String> {
        if device.kind() != DeviceKind::Gpu {
            return None;
        }
        let allocator = device.allocator(AllocatorAttributes::device());
        allocator.as_diagnosable().map(|diag| diag.memory_map())
    }

    pub fn lane_manager(&self) -> &LaneManager {
        &self.lane_manager
    }

    pub fn event_bus(&self) -> &Arc<dyn EventBus> {
        &self.event_bus
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    fn discard(&self, context: ExecutionContext) {
        let id = context.id();
        if let Err(e) = self.engine.finish_context(context) {
            warn!(context_id = id, error = %e, "Failed to finish discarded context");
        }
    }

    fn interrupt_callback(&self, handle: SessionHandle) -> InterruptCallback {
        let registry: Weak<SessionRegistry> = Arc::downgrade(&self.registry);
        let event_bus = Arc::clone(&self.event_bus);
        Box::new(move || {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            let Ok(session) = registry.extract(&handle) else {
                debug!(sess = %handle, "Interrupted session already torn down");
                return;
            };
            info!(sess = %handle, "Interrupting session");
            if let Err(e) = session.safe_close() {
                warn!(sess = %handle, error = %e, "Failed to close interrupted session");
            }
            drop(session);

            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    event_bus
                        .publish(InstanceEvent::SessionInterrupted { session_id: handle })
                        .await;
                });
            }
        })
    }
}
