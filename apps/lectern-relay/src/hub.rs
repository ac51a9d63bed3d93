use std::collections::HashMap;
use std::sync::Arc;

use metrics::{counter, gauge};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use lectern_proto::{
    AckPayload, CommandFailure, CommandForward, RosterEntry, ServerFrame, StudentRef,
};

use crate::config::RelayConfig;
use crate::session::{EnqueueOutcome, Role, Session};

/// Where a control-plane envelope is headed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    Teacher,
    AllStudents,
    Student(String),
}

enum HubRequest {
    Register(Arc<Session>),
    Unregister(Arc<Session>),
    RouteControl {
        target: RouteTarget,
        payload: String,
    },
    RouteCommand {
        issuer: Arc<Session>,
        target_client_id: String,
        command: String,
        data: Value,
    },
}

#[derive(Default)]
struct Registry {
    students: HashMap<String, Arc<Session>>,
    teacher: Option<Arc<Session>>,
}

/// Central router. Membership changes and control-plane relays are funneled
/// through one bounded queue and applied by a single loop, which serializes
/// them: a roster snapshot can never interleave with the join/leave events
/// around it. Capture frames bypass the queue (see `capture`), so a burst of
/// screenshots cannot delay a join.
///
/// The loop only ever performs non-blocking enqueues toward sessions, so a
/// slow consumer stalls nothing here.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
    requests: mpsc::Sender<HubRequest>,
}

struct HubInner {
    registry: RwLock<Registry>,
    max_students: usize,
}

impl Hub {
    /// Builds the hub and spawns its request loop. The loop ends once every
    /// `Hub` handle has been dropped.
    pub fn new(config: &RelayConfig) -> Self {
        let (requests, rx) = mpsc::channel(config.hub_queue_depth);
        let inner = Arc::new(HubInner {
            registry: RwLock::new(Registry::default()),
            max_students: config.max_students,
        });
        tokio::spawn(run_loop(Arc::clone(&inner), rx));
        Self { inner, requests }
    }

    pub async fn register(&self, session: Arc<Session>) {
        self.submit(HubRequest::Register(session)).await;
    }

    /// Removes the session if it is still the one registered under its id.
    /// Safe to call from both pumps; later calls are no-ops.
    pub async fn unregister(&self, session: Arc<Session>) {
        self.submit(HubRequest::Unregister(session)).await;
    }

    /// Queues an already serialized envelope for ordered delivery.
    pub async fn route_control(&self, target: RouteTarget, payload: String) {
        self.submit(HubRequest::RouteControl { target, payload }).await;
    }

    /// Queues a teacher command for its target student. Failures are reported
    /// back to the issuing session, not the target.
    pub async fn route_command(
        &self,
        issuer: Arc<Session>,
        target_client_id: String,
        command: String,
        data: Value,
    ) {
        self.submit(HubRequest::RouteCommand {
            issuer,
            target_client_id,
            command,
            data,
        })
        .await;
    }

    /// Current teacher session, if one is registered. Used by the capture
    /// fast lane to hand frames straight to the teacher's outbox.
    pub fn current_teacher(&self) -> Option<Arc<Session>> {
        self.inner.registry.read().teacher.clone()
    }

    pub fn student_by_id(&self, client_id: &str) -> Option<Arc<Session>> {
        self.inner.registry.read().students.get(client_id).cloned()
    }

    pub fn student_count(&self) -> usize {
        self.inner.registry.read().students.len()
    }

    pub fn has_teacher(&self) -> bool {
        self.inner.registry.read().teacher.is_some()
    }

    pub fn students(&self) -> Vec<Arc<Session>> {
        self.inner.registry.read().students.values().cloned().collect()
    }

    async fn submit(&self, request: HubRequest) {
        if self.requests.send(request).await.is_err() {
            warn!("hub loop stopped, dropping request");
        }
    }
}

async fn run_loop(inner: Arc<HubInner>, mut requests: mpsc::Receiver<HubRequest>) {
    while let Some(request) = requests.recv().await {
        match request {
            HubRequest::Register(session) => inner.handle_register(session),
            HubRequest::Unregister(session) => inner.handle_unregister(&session),
            HubRequest::RouteControl { target, payload } => {
                inner.handle_route_control(target, &payload)
            }
            HubRequest::RouteCommand {
                issuer,
                target_client_id,
                command,
                data,
            } => inner.handle_route_command(&issuer, target_client_id, command, data),
        }
    }
    debug!("hub loop stopped");
}

impl HubInner {
    fn handle_register(&self, session: Arc<Session>) {
        match session.role() {
            Role::Teacher => self.register_teacher(session),
            Role::Student => self.register_student(session),
            Role::Unassigned => {
                warn!(
                    connection = %session.connection_id(),
                    "refusing to register unidentified session"
                );
            }
        }
    }

    fn register_teacher(&self, session: Arc<Session>) {
        let roster = {
            let mut registry = self.registry.write();
            if let Some(previous) = registry.teacher.take() {
                warn!(
                    connection = %previous.connection_id(),
                    "new teacher connected, closing previous teacher session"
                );
                counter!("lectern_teacher_evictions_total", 1);
                previous.close_outbox();
            }
            registry.teacher = Some(Arc::clone(&session));
            registry
                .students
                .values()
                .map(|student| RosterEntry {
                    client_id: student.client_id().unwrap_or_default(),
                    email: student.email(),
                })
                .collect::<Vec<_>>()
        };
        info!(connection = %session.connection_id(), students = roster.len(), "teacher connected");
        self.send_frame(&session, &ServerFrame::InitialRoster { data: roster }, "initial_roster");
    }

    fn register_student(&self, session: Arc<Session>) {
        let Some(client_id) = session.client_id() else {
            warn!(connection = %session.connection_id(), "student session has no client id");
            return;
        };
        let (teacher, student_count) = {
            let mut registry = self.registry.write();
            let replacing = registry.students.contains_key(&client_id);
            if !replacing && registry.students.len() >= self.max_students {
                drop(registry);
                warn!(
                    client_id = %client_id,
                    max_students = self.max_students,
                    "class is full, rejecting student"
                );
                counter!("lectern_students_rejected_total", 1);
                self.send_frame(
                    &session,
                    &ServerFrame::Error {
                        message: "Class is full".to_string(),
                    },
                    "error",
                );
                session.close_outbox();
                return;
            }
            if let Some(stale) = registry.students.insert(client_id.clone(), Arc::clone(&session)) {
                if !Arc::ptr_eq(&stale, &session) {
                    warn!(client_id = %client_id, "replacing existing student session");
                    stale.close_outbox();
                }
            }
            (registry.teacher.clone(), registry.students.len())
        };
        info!(
            client_id = %client_id,
            email = %session.email(),
            students = student_count,
            "student connected"
        );
        gauge!("lectern_students_active", student_count as f64);
        if let Some(teacher) = teacher {
            self.send_frame(
                &teacher,
                &ServerFrame::StudentConnected {
                    data: RosterEntry {
                        client_id: client_id.clone(),
                        email: session.email(),
                    },
                },
                "student_connected",
            );
        }
        self.send_frame(
            &session,
            &ServerFrame::ServerAck {
                data: AckPayload {
                    message: "registered".to_string(),
                },
            },
            "server_ack",
        );
    }

    fn handle_unregister(&self, session: &Arc<Session>) {
        let mut notify: Option<(Arc<Session>, String)> = None;
        {
            let mut registry = self.registry.write();
            let is_teacher = registry
                .teacher
                .as_ref()
                .is_some_and(|teacher| Arc::ptr_eq(teacher, session));
            if is_teacher {
                registry.teacher = None;
                info!(connection = %session.connection_id(), "teacher disconnected");
            } else if let Some(client_id) = session.client_id() {
                let still_registered = registry
                    .students
                    .get(&client_id)
                    .is_some_and(|current| Arc::ptr_eq(current, session));
                if still_registered {
                    registry.students.remove(&client_id);
                    let student_count = registry.students.len();
                    info!(client_id = %client_id, students = student_count, "student disconnected");
                    gauge!("lectern_students_active", student_count as f64);
                    if let Some(teacher) = registry.teacher.clone() {
                        notify = Some((teacher, client_id));
                    }
                }
            }
        }
        if let Some((teacher, client_id)) = notify {
            self.send_frame(
                &teacher,
                &ServerFrame::StudentDisconnected {
                    data: StudentRef { client_id },
                },
                "student_disconnected",
            );
        }
        session.close_outbox();
    }

    fn handle_route_control(&self, target: RouteTarget, payload: &str) {
        let registry = self.registry.read();
        match target {
            RouteTarget::Teacher => match &registry.teacher {
                Some(teacher) => self.deliver(teacher, payload),
                None => debug!("no teacher connected, dropping envelope"),
            },
            RouteTarget::AllStudents => {
                for student in registry.students.values() {
                    self.deliver(student, payload);
                }
            }
            RouteTarget::Student(ref client_id) => match registry.students.get(client_id) {
                Some(student) => self.deliver(student, payload),
                None => debug!(client_id = %client_id, "unknown student, dropping envelope"),
            },
        }
    }

    fn handle_route_command(
        &self,
        issuer: &Arc<Session>,
        target_client_id: String,
        command: String,
        data: Value,
    ) {
        let target = self.registry.read().students.get(&target_client_id).cloned();
        let Some(student) = target else {
            warn!(target = %target_client_id, "command target not found");
            self.send_frame(
                issuer,
                &ServerFrame::CommandFailed {
                    data: CommandFailure {
                        target_client_id,
                        reason: "Student not found".to_string(),
                    },
                },
                "command_failed",
            );
            return;
        };
        info!(target = %target_client_id, command = %command, "relaying command");
        counter!("lectern_commands_relayed_total", 1);
        let forward = CommandForward { command, data };
        match serde_json::to_string(&forward) {
            Ok(json) => self.deliver(&student, &json),
            Err(err) => warn!(error = %err, "failed to serialize command"),
        }
    }

    fn send_frame(&self, session: &Session, frame: &ServerFrame, label: &'static str) {
        match serde_json::to_string(frame) {
            Ok(json) => self.deliver_labeled(session, &json, label),
            Err(err) => warn!(envelope = label, error = %err, "failed to serialize envelope"),
        }
    }

    fn deliver(&self, session: &Session, payload: &str) {
        self.deliver_labeled(session, payload, "relay");
    }

    fn deliver_labeled(&self, session: &Session, payload: &str, label: &'static str) {
        match session.enqueue(payload.to_string()) {
            EnqueueOutcome::Sent => {}
            EnqueueOutcome::Full => {
                counter!("lectern_control_drops_total", 1, "envelope" => label);
                warn!(
                    connection = %session.connection_id(),
                    envelope = label,
                    "outbox full, dropping envelope"
                );
            }
            EnqueueOutcome::Closed => {
                debug!(
                    connection = %session.connection_id(),
                    envelope = label,
                    "outbox closed, dropping envelope"
                );
            }
        }
    }
}
