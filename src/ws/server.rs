//! The room relay hub.
//!
//! Pairs one "app" connection (public/kiosk display) with any number of
//! "controller" connections (personal devices) into a code-addressed room and
//! relays opaque events between them.
//!
//! All room state is owned by a single [`RelayServer`] task consuming a
//! command channel; connection handlers talk to it through a cloneable
//! [`RelayServerHandle`]. Call and spawn [`run`](RelayServer::run) to start
//! processing commands.

use std::{
    collections::HashMap,
    io,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use rand::Rng as _;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::ws::{
    ConnId, Msg, RoomCode,
    models::{
        AppEventPayload, ControllerEventPayload, ControllerIdPayload, ControllerPresencePayload,
        EmptyPayload, EventName, InboundPayload, InitialStatePayload, OutboundPayload,
        RoomCodePayload, RoomIdPayload,
    },
    room::{
        DEFAULT_CODE_ALPHABET, DEFAULT_CODE_LENGTH, Room, RoomCodeGenerator, RoomError,
        RoomRegistry,
    },
};

/// Which side of a room a connection registered as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    App,
    Controller,
}

/// Tracker entry tying a connection to its room and role.
///
/// This is the only per-connection state the hub keeps beyond the outbound
/// sender; relay authorization is re-derived from it plus the registry on
/// every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub room: RoomCode,
    pub role: Role,
}

/// A command received by the [`RelayServer`].
#[derive(Debug)]
pub enum Command {
    Connect {
        conn_tx: mpsc::UnboundedSender<Msg>,
        res_tx: oneshot::Sender<ConnId>,
    },

    Disconnect {
        conn: ConnId,
    },

    Message {
        conn: ConnId,
        payload: InboundPayload,
    },

    SweepRooms,
}

#[derive(Debug, Clone)]
pub struct HubOptions {
    pub code_length: usize,
    pub alphabet: String,
    /// Evict rooms that have had no app and no controllers for this long.
    /// `None` keeps rooms for the life of the process.
    pub idle_room_ttl: Option<Duration>,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            code_length: DEFAULT_CODE_LENGTH,
            alphabet: DEFAULT_CODE_ALPHABET.to_string(),
            idle_room_ttl: None,
        }
    }
}

/// The room relay hub server.
///
/// Contains the room registry, the connection-role tracker, and the relay
/// logic between app and controller connections.
#[derive(Debug)]
pub struct RelayServer {
    /// Map of connection IDs to their outbound message senders.
    sessions: HashMap<ConnId, mpsc::UnboundedSender<Msg>>,

    /// Authoritative room state.
    rooms: RoomRegistry,

    /// Connection role tracker: which room, which role, per connection.
    memberships: HashMap<ConnId, Membership>,

    idle_room_ttl: Option<Duration>,

    /// Tracks the number of currently established connections.
    visitor_count: AtomicUsize,

    /// Command receiver.
    cmd_rx: flume::Receiver<Command>,
}

impl RelayServer {
    #[must_use]
    pub fn new(options: HubOptions) -> (Self, RelayServerHandle) {
        let (cmd_tx, cmd_rx) = flume::unbounded();

        (
            Self {
                sessions: HashMap::new(),
                rooms: RoomRegistry::new(RoomCodeGenerator::new(
                    options.code_length,
                    &options.alphabet,
                )),
                memberships: HashMap::new(),
                idle_room_ttl: options.idle_room_ttl,
                visitor_count: AtomicUsize::new(0),
                cmd_rx,
            },
            RelayServerHandle { cmd_tx },
        )
    }

    /// Register new session and assign unique ID to this session.
    fn connect(&mut self, tx: mpsc::UnboundedSender<Msg>) -> ConnId {
        // ids cross the wire as controllerId/targetId, so stay within the
        // integer range JavaScript clients can compare exactly
        let mut id = rand::rng().random::<u32>() as ConnId;
        while self.sessions.contains_key(&id) {
            id = rand::rng().random::<u32>() as ConnId;
        }
        self.sessions.insert(id, tx);

        let count = self.visitor_count.fetch_add(1, Ordering::SeqCst) + 1;
        log::debug!("Client connected conn_id={id} visitor_count={count}");

        id
    }

    /// Unregister the connection and detach it from its room, if any.
    fn disconnect(&mut self, conn_id: ConnId) {
        let count = self.visitor_count.fetch_sub(1, Ordering::SeqCst) - 1;
        log::debug!("Client disconnected conn_id={conn_id} visitor_count={count}");

        self.sessions.remove(&conn_id);
        self.leave_room(conn_id);
    }

    /// Detach a connection from its current room, notifying affected members.
    ///
    /// An app detaching clears only the room's display slot; the room, its
    /// controllers, and its last-known state survive for a later rejoin.
    fn leave_room(&mut self, conn_id: ConnId) {
        let Some(membership) = self.memberships.remove(&conn_id) else {
            return;
        };

        match membership.role {
            Role::App => {
                if self.rooms.clear_app(&membership.room, conn_id) {
                    log::info!(
                        "App left room {}; keeping room for rejoin",
                        membership.room
                    );
                    self.send_to_controllers(
                        &membership.room,
                        &OutboundPayload::AppDisconnected(EmptyPayload {}),
                    );
                }
            }
            Role::Controller => {
                if self.rooms.remove_controller(&membership.room, conn_id) {
                    log::info!("Controller {conn_id} left room {}", membership.room);
                    self.send_to_app(
                        &membership.room,
                        &OutboundPayload::ControllerDisconnected(ControllerIdPayload {
                            controller_id: conn_id,
                        }),
                    );
                    self.broadcast_controller_presence(&membership.room);
                }
            }
        }
    }

    /// Detach unless the connection already holds exactly this membership,
    /// enforcing the one-room-one-role invariant on re-registration.
    fn leave_room_unless(&mut self, conn_id: ConnId, room: &str, role: Role) {
        let already_member = self
            .memberships
            .get(&conn_id)
            .is_some_and(|m| m.room == room && m.role == role);

        if !already_member {
            self.leave_room(conn_id);
        }
    }

    fn on_message(&mut self, conn_id: ConnId, payload: InboundPayload) -> Result<(), RoomError> {
        log::trace!("Handling {payload} from conn_id={conn_id}");

        match payload {
            InboundPayload::RegisterAppRoom(_) => self.register_app_room(conn_id)?,
            InboundPayload::RejoinAppRoom(p) => self.rejoin_app_room(conn_id, &p.room_code),
            InboundPayload::RegisterControllerRoom(p) => {
                self.register_controller_room(conn_id, &p.room_code);
            }
            InboundPayload::ReportAppState(p) => {
                self.report_app_state(conn_id, &p.room_id, p.state);
            }
            InboundPayload::SendEventToApp(p) => {
                self.send_event_to_app(conn_id, &p.room_id, p.event_name, p.payload);
            }
            InboundPayload::SendEventToControllers(p) => {
                self.send_event_to_controllers(conn_id, &p.room_id, p.event_name, p.payload);
            }
            InboundPayload::SendEventToController(p) => {
                self.send_event_to_controller(
                    conn_id,
                    &p.room_id,
                    p.target_id,
                    p.event_name,
                    p.payload,
                );
            }
        }

        Ok(())
    }

    /// Allocate a fresh room with this connection as its app.
    ///
    /// Codespace exhaustion is a configuration error, not a client one, so it
    /// propagates and tears the hub down instead of replying.
    fn register_app_room(&mut self, conn_id: ConnId) -> Result<(), RoomError> {
        self.leave_room(conn_id);

        let code = self.rooms.create(conn_id)?;
        self.memberships.insert(
            conn_id,
            Membership {
                room: code.clone(),
                role: Role::App,
            },
        );

        log::info!("App {conn_id} registered new room {code}");

        self.send_to(
            conn_id,
            &OutboundPayload::YourRoomId(RoomIdPayload {
                room_id: code.clone(),
            }),
        );
        self.send_initial_state(conn_id, &code);

        Ok(())
    }

    /// Reclaim an existing room as its app after a disconnect.
    fn rejoin_app_room(&mut self, conn_id: ConnId, room_code: &str) {
        let code = room_code.to_uppercase();

        if !self.rooms.contains(&code) {
            log::info!("App {conn_id} failed to rejoin unknown room {code}");
            self.send_to(
                conn_id,
                &OutboundPayload::RejoinFailed(RoomCodePayload { room_code: code }),
            );
            return;
        }

        self.leave_room_unless(conn_id, &code, Role::App);
        self.rooms.set_app(&code, conn_id);
        self.memberships.insert(
            conn_id,
            Membership {
                room: code.clone(),
                role: Role::App,
            },
        );

        log::info!("App {conn_id} rejoined room {code}");

        self.send_to(
            conn_id,
            &OutboundPayload::YourRoomId(RoomIdPayload {
                room_id: code.clone(),
            }),
        );
        self.send_initial_state(conn_id, &code);

        // controllers reload into the controller UI for the returning app
        self.send_to_controllers(&code, &OutboundPayload::AppReconnected(EmptyPayload {}));
        self.send_to_controllers(
            &code,
            &OutboundPayload::ControllerRefresh(RoomCodePayload {
                room_code: code.clone(),
            }),
        );
    }

    /// Join an existing room as a controller.
    fn register_controller_room(&mut self, conn_id: ConnId, room_code: &str) {
        let code = room_code.to_uppercase();

        if !self.rooms.contains(&code) {
            log::warn!("Controller {conn_id} failed to join invalid room {code}");
            self.send_to(
                conn_id,
                &OutboundPayload::InvalidRoom(RoomCodePayload { room_code: code }),
            );
            return;
        }

        self.leave_room_unless(conn_id, &code, Role::Controller);
        self.rooms.add_controller(&code, conn_id);
        self.memberships.insert(
            conn_id,
            Membership {
                room: code.clone(),
                role: Role::Controller,
            },
        );

        log::info!(
            "Controller {conn_id} joined room {code} total={}",
            self.rooms.get(&code).map_or(0, Room::controller_count)
        );

        self.send_to(
            conn_id,
            &OutboundPayload::JoinSuccess(RoomIdPayload {
                room_id: code.clone(),
            }),
        );
        self.send_to_app(
            &code,
            &OutboundPayload::ControllerJoined(ControllerIdPayload {
                controller_id: conn_id,
            }),
        );
        self.broadcast_controller_presence(&code);
    }

    /// Overwrite the room's last-known app state, for hand-back on rejoin.
    fn report_app_state(&mut self, conn_id: ConnId, room_id: &str, state: Value) {
        let code = room_id.to_uppercase();

        if self.rooms.get(&code).is_some_and(|room| room.is_app(conn_id)) {
            self.rooms.set_app_state(&code, state);
        } else {
            log::warn!("Dropping app state report from {conn_id} for room {code}: not the app");
        }
    }

    /// Relay a controller event to the room's app, if one is connected.
    fn send_event_to_app(
        &self,
        conn_id: ConnId,
        room_id: &str,
        event_name: EventName,
        payload: Value,
    ) {
        let code = room_id.to_uppercase();

        let Some(room) = self.rooms.get(&code) else {
            log::warn!("Unauthorized event from {conn_id} for unknown room {code}");
            return;
        };
        if !room.has_controller(conn_id) {
            log::warn!("Unauthorized event from {conn_id} for room {code}: not a controller");
            return;
        }

        // no live app: dropped, not queued
        if let Some(app_conn_id) = room.app_conn_id() {
            self.send_to(
                app_conn_id,
                &OutboundPayload::ControllerEvent(ControllerEventPayload {
                    event_name,
                    payload,
                    controller_id: conn_id,
                }),
            );
        }
    }

    /// Broadcast an app event to every controller currently in the room.
    fn send_event_to_controllers(
        &self,
        conn_id: ConnId,
        room_id: &str,
        event_name: EventName,
        payload: Value,
    ) {
        let code = room_id.to_uppercase();

        if !self.rooms.get(&code).is_some_and(|room| room.is_app(conn_id)) {
            log::warn!("Unauthorized app->controllers event from {conn_id} for room {code}");
            return;
        }

        self.send_to_controllers(
            &code,
            &OutboundPayload::AppEvent(AppEventPayload {
                event_name,
                payload,
            }),
        );
    }

    /// Relay an app event to one controller; silently dropped if the target
    /// is not currently a member.
    fn send_event_to_controller(
        &self,
        conn_id: ConnId,
        room_id: &str,
        target_id: ConnId,
        event_name: EventName,
        payload: Value,
    ) {
        let code = room_id.to_uppercase();

        let Some(room) = self.rooms.get(&code) else {
            log::warn!("Unauthorized app->controller event from {conn_id} for unknown room {code}");
            return;
        };
        if !room.is_app(conn_id) {
            log::warn!("Unauthorized app->controller event from {conn_id} for room {code}");
            return;
        }

        if room.has_controller(target_id) {
            self.send_to(
                target_id,
                &OutboundPayload::AppEvent(AppEventPayload {
                    event_name,
                    payload,
                }),
            );
        } else {
            log::debug!("Dropping unicast to {target_id}: not a controller of room {code}");
        }
    }

    /// Push the current controller count to the room's app, if connected.
    fn broadcast_controller_presence(&self, code: &str) {
        let Some(room) = self.rooms.get(code) else {
            return;
        };
        let Some(app_conn_id) = room.app_conn_id() else {
            return;
        };

        self.send_to(
            app_conn_id,
            &OutboundPayload::ControllerPresenceChanged(ControllerPresencePayload {
                controller_count: room.controller_count(),
            }),
        );
    }

    fn send_initial_state(&self, conn_id: ConnId, code: &str) {
        let state = self
            .rooms
            .get(code)
            .map_or_else(crate::ws::models::empty_object, |room| {
                room.last_known_app_state().clone()
            });

        self.send_to(
            conn_id,
            &OutboundPayload::InitialState(InitialStatePayload { state }),
        );
    }

    fn sweep_rooms(&mut self) {
        let Some(max_idle) = self.idle_room_ttl else {
            return;
        };

        for code in self.rooms.sweep_abandoned(max_idle) {
            log::info!("Evicted idle room {code}");
        }
    }

    /// Send a message directly to the connection.
    fn send_to(&self, conn_id: ConnId, payload: &OutboundPayload) {
        match serde_json::to_string(payload) {
            Ok(msg) => self.send_raw(conn_id, msg),
            Err(err) => log::error!("Failed to serialize {payload} message: {err}"),
        }
    }

    /// Send a message to the room's app, if one is connected.
    fn send_to_app(&self, code: &str, payload: &OutboundPayload) {
        if let Some(app_conn_id) = self.rooms.get(code).and_then(Room::app_conn_id) {
            self.send_to(app_conn_id, payload);
        }
    }

    /// Send a message to every controller currently in the room.
    fn send_to_controllers(&self, code: &str, payload: &OutboundPayload) {
        let Some(room) = self.rooms.get(code) else {
            return;
        };

        match serde_json::to_string(payload) {
            Ok(msg) => {
                for conn_id in room.controller_conn_ids() {
                    self.send_raw(*conn_id, msg.clone());
                }
            }
            Err(err) => log::error!("Failed to serialize {payload} message: {err}"),
        }
    }

    fn send_raw(&self, conn_id: ConnId, msg: Msg) {
        if let Some(session) = self.sessions.get(&conn_id) {
            // errors if client disconnected abruptly and hasn't been timed-out yet
            let _ = session.send(msg);
        } else {
            log::debug!("Dropping message to unknown connection {conn_id}");
        }
    }

    /// Process a single command.
    ///
    /// # Errors
    ///
    /// * Only on room-code exhaustion, which is fatal to the hub.
    pub fn process_command(&mut self, cmd: Command) -> io::Result<()> {
        match cmd {
            Command::Connect { conn_tx, res_tx } => {
                let conn_id = self.connect(conn_tx);
                if res_tx.send(conn_id).is_err() {
                    // handler went away before learning its id
                    self.disconnect(conn_id);
                }
            }

            Command::Disconnect { conn } => self.disconnect(conn),

            Command::Message { conn, payload } => {
                self.on_message(conn, payload).map_err(io::Error::other)?;
            }

            Command::SweepRooms => self.sweep_rooms(),
        }

        Ok(())
    }

    /// Consume commands until every handle is dropped or the process-wide
    /// cancellation token fires.
    ///
    /// # Errors
    ///
    /// * If a command fails fatally (room-code exhaustion).
    pub async fn run(mut self) -> io::Result<()> {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv_async() => match cmd {
                    Ok(cmd) => self.process_command(cmd)?,
                    Err(_) => break,
                },
                () = crate::CANCELLATION_TOKEN.cancelled() => break,
            }
        }

        Ok(())
    }

    #[cfg(test)]
    fn membership(&self, conn_id: ConnId) -> Option<&Membership> {
        self.memberships.get(&conn_id)
    }

    #[cfg(test)]
    const fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }
}

/// Handle and command sender for the relay server.
///
/// Reduces boilerplate of setting up response channels in WebSocket handlers.
#[derive(Debug, Clone)]
pub struct RelayServerHandle {
    cmd_tx: flume::Sender<Command>,
}

impl RelayServerHandle {
    /// Register client message sender and obtain connection ID.
    pub async fn connect(&self, conn_tx: mpsc::UnboundedSender<Msg>) -> ConnId {
        let (res_tx, res_rx) = oneshot::channel();

        // unwrap: relay server should not have been dropped
        self.cmd_tx
            .send(Command::Connect { conn_tx, res_tx })
            .unwrap();

        // unwrap: relay server does not drop our response channel
        res_rx.await.unwrap()
    }

    /// Hand a parsed protocol message to the hub.
    pub fn message(&self, conn: ConnId, payload: InboundPayload) {
        // unwrap: relay server should not have been dropped
        self.cmd_tx.send(Command::Message { conn, payload }).unwrap();
    }

    /// Unregister message sender and detach the connection from its room.
    pub fn disconnect(&self, conn: ConnId) {
        // unwrap: relay server should not have been dropped
        self.cmd_tx.send(Command::Disconnect { conn }).unwrap();
    }

    /// Trigger an idle-room sweep.
    pub fn sweep_rooms(&self) {
        // unwrap: relay server should not have been dropped
        self.cmd_tx.send(Command::SweepRooms).unwrap();
    }
}
