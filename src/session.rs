//! Session: the X connection, init/teardown and the frame scheduler.
//!
//! Single-threaded cooperative loop: X events are drained and dispatched
//! between sleeps, damage batches into frames, fades arm a periodic timer
//! and the delayed-unredirect deadline arms a one-shot. The X connection's
//! fd is registered with the tokio reactor, so everything -- compositing,
//! event dispatch, timers, signals -- runs on this one task.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use x11rb::connection::{Connection, RequestConnection};
use x11rb::protocol::composite::ConnectionExt as _;
use x11rb::protocol::damage::{self, ConnectionExt as _};
use x11rb::protocol::randr::{self, ConnectionExt as _};
use x11rb::protocol::render::ConnectionExt as _;
use x11rb::protocol::shape::{self, ConnectionExt as _};
use x11rb::protocol::xfixes::ConnectionExt as _;
use x11rb::protocol::xinerama::ConnectionExt as _;
use x11rb::protocol::xproto::{
    AtomEnum, ChangeWindowAttributesAux, ConnectionExt as _, CreateWindowAux, EventMask, MapState,
    PropMode, WindowClass,
};
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as _;

use crate::backend::{xrender::init_backend, Backend, ImageOp};
use crate::config::Config;
use crate::core::Core;
use crate::props::{self, Atoms, VisualFormats};
use crate::redirect::{RedirAction, UnredirTimer};
use crate::region::Region;
use crate::stack::WinKey;
use crate::win::{Window, Xid};
use crate::xerror::ErrorFilter;

/// How a session run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Quit,
    /// SIGUSR1: tear down and start over.
    Reset,
}

/// The X connection's file descriptor, registered with the tokio reactor.
/// The descriptor is owned by the connection; this only borrows its number,
/// so it must be dropped (deregistered) before the last `Arc` to the
/// connection goes away.
pub(crate) struct XFd(RawFd);

impl AsRawFd for XFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

pub struct Session {
    /// Declared before `conn` so the reactor registration is torn down
    /// while the descriptor is still open.
    pub(crate) xfd: AsyncFd<XFd>,
    pub(crate) conn: Arc<RustConnection>,
    pub(crate) root: Xid,
    pub(crate) root_visual: u32,
    pub(crate) overlay: Option<Xid>,
    pub(crate) reg_win: Xid,
    pub(crate) atoms: Atoms,
    pub(crate) visuals: VisualFormats,
    pub(crate) core: Core,
    pub(crate) backend: Box<dyn Backend>,
    pub(crate) errors: ErrorFilter,
    pub(crate) unredir: UnredirTimer,
    pub(crate) start: Instant,
    pub(crate) shape_exists: bool,
    pub(crate) xinerama_exists: bool,
    pub(crate) needs_render: bool,
    pub(crate) fades_running: bool,
    pub(crate) quit: bool,
    pub(crate) reset: bool,
    /// An unrecoverable condition noticed during event handling.
    pub(crate) fatal: Option<String>,
}

impl Session {
    pub fn new(config: Config) -> Result<Self> {
        let (conn, screen_num) =
            x11rb::connect(None).context("Failed to connect to the X server")?;
        let conn = Arc::new(conn);
        let screen = &conn.setup().roots[screen_num];
        let root = screen.root;
        let root_visual = screen.root_visual;
        let (root_width, root_height) = (screen.width_in_pixels, screen.height_in_pixels);
        info!(
            "Connected to X, screen {}, root {:#010x}, {}x{}",
            screen_num, root, root_width, root_height
        );

        // Mandatory extensions; version negotiation doubles as a presence
        // check.
        let composite_version = conn
            .composite_query_version(0, 4)
            .context("Composite extension missing")?
            .reply()
            .context("Composite version query failed")?;
        if composite_version.major_version == 0 && composite_version.minor_version < 2 {
            bail!(
                "Composite extension too old: {}.{}",
                composite_version.major_version,
                composite_version.minor_version
            );
        }
        conn.damage_query_version(1, 1)
            .context("Damage extension missing")?
            .reply()
            .context("Damage version query failed")?;
        conn.xfixes_query_version(4, 0)
            .context("XFixes extension missing")?
            .reply()
            .context("XFixes version query failed")?;
        conn.render_query_version(0, 11)
            .context("Render extension missing")?
            .reply()
            .context("Render version query failed")?;

        let optional = |name: &'static str| -> bool {
            let present = conn
                .extension_information(name)
                .ok()
                .flatten()
                .is_some();
            if !present {
                warn!("{} extension missing, dependent features disabled", name);
            }
            present
        };
        let shape_exists = optional(shape::X11_EXTENSION_NAME);
        let randr_exists = optional(randr::X11_EXTENSION_NAME);
        let xinerama_exists = optional(x11rb::protocol::xinerama::X11_EXTENSION_NAME);
        let present_exists = optional(x11rb::protocol::present::X11_EXTENSION_NAME);
        let sync_exists = optional(x11rb::protocol::sync::X11_EXTENSION_NAME);
        debug!(
            "Optional extensions: shape={} randr={} xinerama={} present={} sync={}",
            shape_exists, randr_exists, xinerama_exists, present_exists, sync_exists
        );

        let atoms = Atoms::new(conn.as_ref(), screen_num)?;
        let visuals = VisualFormats::query(conn.as_ref())?;

        // Own the composite-manager selection; a clash is fatal.
        let reg_win = conn.generate_id()?;
        conn.create_window(
            x11rb::COPY_DEPTH_FROM_PARENT,
            reg_win,
            root,
            0,
            0,
            1,
            1,
            0,
            WindowClass::INPUT_OUTPUT,
            x11rb::COPY_FROM_PARENT,
            &CreateWindowAux::new(),
        )?;
        conn.change_property32(
            PropMode::REPLACE,
            reg_win,
            atoms.net_wm_pid,
            AtomEnum::CARDINAL,
            &[std::process::id()],
        )?;
        conn.change_property8(
            PropMode::REPLACE,
            reg_win,
            atoms.veil_version,
            atoms.utf8_string,
            env!("CARGO_PKG_VERSION").as_bytes(),
        )?;
        let owner = conn.get_selection_owner(atoms.cm_selection)?.reply()?.owner;
        if owner != x11rb::NONE {
            bail!("Another composite manager is already running");
        }
        conn.set_selection_owner(reg_win, atoms.cm_selection, x11rb::CURRENT_TIME)?;

        // The overlay window, made click-through.
        let overlay = match conn.composite_get_overlay_window(root)?.reply() {
            Ok(reply) => {
                let overlay = reply.overlay_win;
                if shape_exists {
                    conn.shape_rectangles(
                        shape::SO::SET,
                        shape::SK::INPUT,
                        x11rb::protocol::xproto::ClipOrdering::UNSORTED,
                        overlay,
                        0,
                        0,
                        &[],
                    )?;
                }
                info!("Using composite overlay window {:#010x}", overlay);
                Some(overlay)
            }
            Err(e) => {
                warn!("No overlay window, painting to root: {}", e);
                None
            }
        };

        conn.change_window_attributes(
            root,
            &ChangeWindowAttributesAux::new().event_mask(
                EventMask::STRUCTURE_NOTIFY
                    | EventMask::SUBSTRUCTURE_NOTIFY
                    | EventMask::EXPOSURE
                    | EventMask::PROPERTY_CHANGE,
            ),
        )?;
        if randr_exists {
            conn.randr_select_input(root, randr::NotifyMask::SCREEN_CHANGE)?;
        }

        let backend = init_backend(
            &config.general.backend,
            conn.clone(),
            root,
            root_visual,
            root_width,
            root_height,
            overlay,
            &config.blur,
        )
        .context("Backend initialization failed")?;

        if let Some(path) = &config.general.pid_file {
            if let Err(e) = std::fs::write(path, format!("{}\n", std::process::id())) {
                warn!("Failed to write PID file {:?}: {}", path, e);
            }
        }

        let mut core = Core::new(config, root_width, root_height);
        core.damage.reset(backend.max_buffer_age());
        let shadow_excl = core
            .config
            .shadow
            .exclude_region
            .as_deref()
            .and_then(crate::config::parse_geometry);
        if let Some(rect) = shadow_excl {
            core.shadow_exclude_reg = Region::from_rect(rect);
        }

        // Wake the main loop whenever the server has something for us.
        // Must run inside the runtime; `main` is already async by here.
        let xfd = AsyncFd::with_interest(XFd(conn.stream().as_raw_fd()), Interest::READABLE)
            .context("Failed to register the X fd with the reactor")?;
        conn.flush()?;

        let mut session = Self {
            xfd,
            conn,
            root,
            root_visual,
            overlay,
            reg_win,
            atoms,
            visuals,
            core,
            backend,
            errors: ErrorFilter::default(),
            unredir: UnredirTimer::default(),
            start: Instant::now(),
            shape_exists,
            xinerama_exists,
            needs_render: true,
            fades_running: false,
            quit: false,
            reset: false,
            fatal: None,
        };

        session.update_xinerama_screens();
        session.manage_existing_windows()?;
        session.redir_start()?;
        session.refresh_root_tile();
        session.recheck_focus();
        session.conn.flush()?;
        Ok(session)
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Take over windows that existed before we started. `query_tree`
    /// reports children bottom-to-top, so each window stacks above the one
    /// before it.
    fn manage_existing_windows(&mut self) -> Result<()> {
        let tree = self.conn.query_tree(self.root)?.reply()?;
        info!("Managing {} existing windows", tree.children.len());
        let mut prev = 0;
        for child in tree.children {
            if self.add_window(child, prev).is_some() {
                prev = child;
            }
        }
        // Map state is only known after the windows are registered.
        for key in self.core.stack.order_snapshot() {
            let Some(w) = self.core.stack.get(key) else { continue };
            let id = w.id;
            let is_viewable = match self.conn.get_window_attributes(id) {
                Ok(cookie) => matches!(cookie.reply(), Ok(attrs) if attrs.map_state == MapState::VIEWABLE),
                Err(_) => continue,
            };
            if is_viewable {
                self.map_win_x(key);
            }
        }
        Ok(())
    }

    /// Register a window with the registry and create its damage object.
    pub(crate) fn add_window(&mut self, id: Xid, prev: Xid) -> Option<WinKey> {
        if Some(id) == self.overlay || id == self.reg_win {
            return None;
        }
        if self.core.stack.find(id).is_some() {
            // The registry logs the duplicate.
            return self.core.stack.find(id);
        }
        let attrs = self.conn.get_window_attributes(id).ok()?.reply().ok()?;
        if attrs.map_state == MapState::UNVIEWABLE {
            // Already reparented away from the root.
            return None;
        }
        let geom = self.conn.get_geometry(id).ok()?.reply().ok()?;

        let mut w = Window::new(
            id,
            crate::win::Geometry::new(
                geom.x as i32,
                geom.y as i32,
                geom.width,
                geom.height,
                geom.border_width,
            ),
        );
        w.input_only = attrs.class == WindowClass::INPUT_ONLY;
        w.override_redirect = attrs.override_redirect;
        w.visual = attrs.visual;
        if let Some(vi) = self.visuals.get(attrs.visual) {
            w.depth = vi.depth;
            w.has_alpha = vi.has_alpha;
        }

        if !w.input_only {
            let did = self.conn.generate_id().ok()?;
            match self
                .conn
                .damage_create(did, id, damage::ReportLevel::NON_EMPTY)
            {
                Ok(cookie) => {
                    self.errors.ignore(cookie.sequence_number());
                    w.damage = Some(did);
                }
                Err(e) => {
                    debug!("Failed to create damage for {:#010x}: {}", id, e);
                }
            }
        }

        self.core.add_win(w, prev)
    }

    /// The X-facing half of mapping: subscribe to the window, detect its
    /// client, refresh every property the effects depend on, then run the
    /// state machine.
    pub(crate) fn map_win_x(&mut self, key: WinKey) {
        let Some(w) = self.core.stack.get(key) else { return };
        let id = w.id;
        if w.input_only {
            return;
        }

        let _ = self.conn.change_window_attributes(
            id,
            &ChangeWindowAttributesAux::new().event_mask(props::frame_evmask()),
        );
        if self.shape_exists {
            let _ = self.conn.shape_select_input(id, true);
        }

        // The client window is ready by map time.
        let client = self.core.stack.get(key).map_or(0, |w| w.client_win);
        if client == 0 {
            let found = props::find_client_win(self.conn.as_ref(), &self.atoms, id).unwrap_or(id);
            self.mark_client(key, found);
        } else {
            self.refresh_client_props(key);
        }

        self.refresh_bounding_shape(key);

        let Session { core, backend, .. } = self;
        core.map_win(key, backend.as_mut());
        core.update_win_screen(key);
        self.factor_change(key);
        self.recheck_focus();
    }

    /// Re-match rule caches and mirror an opacity-rule change back into the
    /// window's property.
    pub(crate) fn factor_change(&mut self, key: WinKey) {
        let rule = self.core.win_on_factor_change(key);
        self.write_opacity_rule(key, rule);
    }

    /// Attach a client window: event interest plus the property snapshot.
    pub(crate) fn mark_client(&mut self, key: WinKey, client: Xid) {
        let Some(w) = self.core.stack.get_mut(key) else { return };
        let toplevel = w.id;
        w.client_win = client;
        w.wmwin = client != toplevel;
        if client != toplevel {
            let _ = self.conn.change_window_attributes(
                client,
                &ChangeWindowAttributesAux::new().event_mask(props::client_evmask()),
            );
        }
        self.refresh_client_props(key);
    }

    /// Pull every client-side property we consume.
    pub(crate) fn refresh_client_props(&mut self, key: WinKey) {
        let Some(w) = self.core.stack.get(key) else { return };
        let (id, client) = (w.id, if w.client_win != 0 { w.client_win } else { w.id });
        let conn = self.conn.as_ref();

        let wintype = props::get_wintype_prop(conn, &self.atoms, client);
        let opacity = props::get_opacity_prop(conn, &self.atoms, id)
            .or_else(|| props::get_opacity_prop(conn, &self.atoms, client));
        let frame_extents = props::get_frame_extents(conn, &self.atoms, client);
        let name = props::get_name(conn, &self.atoms, client);
        let (instance, general) = props::get_class(conn, &self.atoms, client);
        let role = props::get_role(conn, &self.atoms, client);
        let leader = props::get_leader(conn, &self.atoms, client);
        let prop_shadow = props::get_cardinal(conn, id, self.atoms.compton_shadow)
            .ok()
            .flatten();
        let has_transient = props::has_prop(conn, client, self.atoms.wm_transient_for);

        let Some(w) = self.core.stack.get_mut(key) else { return };
        w.wintype = wintype.unwrap_or({
            // EWMH fallback: transients without a type are dialogs.
            if w.override_redirect || !has_transient {
                crate::win::WinType::Normal
            } else {
                crate::win::WinType::Dialog
            }
        });
        w.has_opacity_prop = opacity.is_some();
        w.opacity_prop = opacity.unwrap_or(u32::MAX);
        w.frame_extents = frame_extents;
        w.name = name;
        w.class_instance = instance;
        w.class_general = general;
        w.role = role;
        w.prop_shadow = prop_shadow;
        if w.leader != leader {
            w.leader = leader;
            self.core.clear_leader_caches();
        }
        if let Some(w) = self.core.stack.get_mut(key) {
            w.flags |= crate::win::WinFlags::OPACITY_STALE;
        }
    }

    pub(crate) fn refresh_bounding_shape(&mut self, key: WinKey) {
        let Some(w) = self.core.stack.get(key) else { return };
        let (id, bw, wb, hb) = (w.id, w.geom.border_width, w.widthb(), w.heightb());
        let (region, shaped) =
            props::get_bounding_shape(self.conn.as_ref(), self.shape_exists, id, bw, wb, hb);
        if let Some(w) = self.core.stack.get_mut(key) {
            w.bounding_shape = region;
            w.bounding_shaped = shaped;
        }
    }

    /// Mirror an opacity-rule change into the window's property.
    pub(crate) fn write_opacity_rule(&mut self, key: WinKey, value: Option<Option<f64>>) {
        let Some(change) = value else { return };
        let Some(w) = self.core.stack.get(key) else { return };
        let id = w.id;
        match change {
            Some(v) => {
                let _ = props::set_opacity_prop(
                    self.conn.as_ref(),
                    &self.atoms,
                    id,
                    (v * u32::MAX as f64) as u32,
                );
            }
            None => {
                let _ = props::delete_opacity_prop(self.conn.as_ref(), &self.atoms, id);
            }
        }
    }

    /// Figure out the focused toplevel, via EWMH when enabled, else the
    /// server's input focus.
    pub(crate) fn recheck_focus(&mut self) {
        let focused = if self.core.config.general.use_ewmh_active_win {
            props::get_cardinal(self.conn.as_ref(), self.root, self.atoms.net_active_window)
                .ok()
                .flatten()
                .filter(|w| *w != 0)
        } else {
            self.conn
                .get_input_focus()
                .ok()
                .and_then(|c| c.reply().ok())
                .map(|r| r.focus)
                .filter(|w| *w != 0 && *w != 1)
        };

        let key = focused.and_then(|wid| self.find_toplevel_for(wid));
        self.core.set_active_win(key);
    }

    /// Resolve any window id to the toplevel containing it, walking up the
    /// tree when needed.
    pub(crate) fn find_toplevel_for(&self, mut wid: Xid) -> Option<WinKey> {
        for _ in 0..32 {
            if let Some(k) = self.core.stack.find(wid) {
                return Some(k);
            }
            if let Some(k) = self.core.stack.find_toplevel(wid) {
                return Some(k);
            }
            let tree = self.conn.query_tree(wid).ok()?.reply().ok()?;
            if tree.parent == x11rb::NONE || tree.parent == tree.root {
                return None;
            }
            wid = tree.parent;
        }
        None
    }

    /// (Re)bind the desktop background pixmap as the root tile.
    pub(crate) fn refresh_root_tile(&mut self) {
        if let Some(old) = self.core.root_image.take() {
            self.backend.release_image(old);
        }
        let conn = self.conn.as_ref();
        let pixmap = [
            self.atoms.xrootpmap_id,
            self.atoms.esetroot_pmap_id,
            self.atoms.xsetroot_id,
        ]
        .iter()
        .find_map(|atom| props::get_cardinal(conn, self.root, *atom).ok().flatten())
        .filter(|p| *p != 0);

        if let Some(pixmap) = pixmap {
            let vi = self
                .visuals
                .get(self.root_visual)
                .unwrap_or(crate::backend::VisualInfo {
                    visual: self.root_visual,
                    depth: 24,
                    has_alpha: false,
                });
            match self.backend.bind_pixmap(pixmap, vi, false) {
                Ok(img) => {
                    self.backend.image_op(
                        ImageOp::ResizeTile(
                            self.core.root_width as i32,
                            self.core.root_height as i32,
                        ),
                        img,
                        &self.core.screen_reg,
                    );
                    self.core.root_image = Some(img);
                    debug!("Root tile bound from pixmap {:#010x}", pixmap);
                }
                Err(e) => warn!("Failed to bind root pixmap: {}", e),
            }
        }
        self.core.force_repaint();
    }

    pub(crate) fn update_xinerama_screens(&mut self) {
        self.core.xinerama_regs.clear();
        if !self.xinerama_exists {
            return;
        }
        if let Ok(Ok(reply)) = self.conn.xinerama_query_screens().map(|c| c.reply()) {
            self.core.xinerama_regs = reply
                .screen_info
                .iter()
                .map(|s| {
                    Region::rect(
                        s.x_org as i32,
                        s.y_org as i32,
                        s.width as i32,
                        s.height as i32,
                    )
                })
                .collect();
            debug!("{} xinerama screens", self.core.xinerama_regs.len());
        }
        for key in self.core.stack.order_snapshot() {
            self.core.update_win_screen(key);
        }
    }

    /// One frame: preprocess, redirection control, paint.
    pub(crate) fn frame(&mut self) -> Result<()> {
        let now_ms = self.now_ms();
        let decision = {
            let Session { core, backend, conn, visuals, errors, .. } = self;
            let mut rebind = |w: &mut Window, be: &mut dyn Backend| {
                bind_window_image(conn, visuals, errors, be, w)
            };
            core.paint_preprocess(now_ms, backend.as_mut(), &mut rebind)
        };
        self.fades_running = decision.fade_running;

        match self.unredir.decide(
            decision.unredir_possible,
            self.core.redirected,
            self.core.config.unredir.delay_ms,
            now_ms,
        ) {
            RedirAction::Start => {
                self.redir_start()?;
                self.needs_render = true;
            }
            RedirAction::Stop => self.redir_stop()?,
            RedirAction::None => {}
        }

        if self.core.redirected {
            let benchmark = self.core.config.general.benchmark;
            let force = benchmark > 0;
            if force {
                self.core.force_repaint();
            }
            let painted = {
                let Session { core, backend, .. } = self;
                core.paint_frame(&decision.paint, backend.as_mut(), force)
            };
            if painted {
                self.backend.handle_events()?;
            }
            if benchmark > 0 {
                if self.core.paint_count >= benchmark {
                    info!("Benchmark done after {} paints", self.core.paint_count);
                    self.quit = true;
                } else {
                    // Keep the frames coming regardless of damage.
                    self.needs_render = true;
                }
            }
        }
        self.conn.flush()?;
        Ok(())
    }

    /// The cooperative main loop.
    pub async fn run(&mut self) -> Result<RunOutcome> {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigusr1 = signal(SignalKind::user_defined1())?;

        let fade_delta = Duration::from_millis(self.core.config.fading.fade_delta_ms.max(1));
        let mut fade_interval = tokio::time::interval(fade_delta);
        fade_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Entering main loop");
        loop {
            // Handle everything the server queued, then flush our own
            // requests before sleeping.
            let mut had_events = false;
            while let Some(event) = self.conn.poll_for_event()? {
                had_events = true;
                self.handle_event(event);
            }
            if had_events {
                self.needs_render = true;
            }
            self.conn.flush()?;

            if self.quit {
                if let Some(msg) = self.fatal.take() {
                    bail!(msg);
                }
                return Ok(RunOutcome::Quit);
            }
            if self.reset {
                return Ok(RunOutcome::Reset);
            }

            if self.needs_render {
                self.needs_render = false;
                self.frame()?;
                if self.quit {
                    if let Some(msg) = self.fatal.take() {
                        bail!(msg);
                    }
                    return Ok(RunOutcome::Quit);
                }
                // Events may have arrived while painting.
                continue;
            }

            let now = self.now_ms();
            let unredir_sleep = self
                .unredir
                .deadline()
                .map(|d| Duration::from_millis(d.saturating_sub(now)));

            tokio::select! {
                ready = self.xfd.readable() => {
                    match ready {
                        // Clear the cached readiness; the drain at the top
                        // of the loop empties the socket, so the next event
                        // produces fresh readiness.
                        Ok(mut guard) => guard.clear_ready(),
                        Err(e) => {
                            self.fatal = Some(format!("X connection lost: {}", e));
                            self.quit = true;
                        }
                    }
                }
                _ = fade_interval.tick(), if self.fades_running => {
                    self.needs_render = true;
                }
                _ = tokio::time::sleep(unredir_sleep.unwrap_or(Duration::from_secs(86400))),
                    if unredir_sleep.is_some() =>
                {
                    self.needs_render = true;
                }
                _ = sigint.recv() => {
                    info!("SIGINT, shutting down");
                    self.quit = true;
                }
                _ = sigterm.recv() => {
                    info!("SIGTERM, shutting down");
                    self.quit = true;
                }
                _ = sigusr1.recv() => {
                    info!("SIGUSR1, restarting session");
                    self.reset = true;
                }
            }
        }
    }

    /// Orderly teardown: unredirect, free windows in stack order, release
    /// the selection.
    pub fn destroy(&mut self) {
        if let Err(e) = self.redir_stop() {
            warn!("Unredirect during teardown failed: {}", e);
        }
        for key in self.core.stack.order_snapshot() {
            if let Some(w) = self.core.stack.get(key) {
                if let Some(damage) = w.damage {
                    let _ = self.conn.damage_destroy(damage);
                }
            }
            let Session { core, backend, .. } = self;
            if let Some(mut w) = core.stack.remove(key) {
                Core::release_win_images(&mut w, backend.as_mut());
            }
        }
        if let Some(img) = self.core.root_image.take() {
            self.backend.release_image(img);
        }
        if self.overlay.is_some() {
            let _ = self.conn.composite_release_overlay_window(self.root);
        }
        let _ = self.conn.destroy_window(self.reg_win);
        if let Some(path) = &self.core.config.general.pid_file {
            let _ = std::fs::remove_file(path);
        }
        let _ = self.conn.flush();
        info!("Session destroyed");
    }
}

/// Bind (or rebind) the redirected pixmap of one window. The stale shadow
/// image goes with it, to be rebuilt lazily at the right size.
pub(crate) fn bind_window_image(
    conn: &Arc<RustConnection>,
    visuals: &VisualFormats,
    errors: &mut ErrorFilter,
    backend: &mut dyn Backend,
    w: &mut Window,
) -> bool {
    let Ok(pixmap) = conn.generate_id() else { return false };
    let named = match conn.composite_name_window_pixmap(w.id, pixmap) {
        Ok(cookie) => {
            errors.ignore(cookie.sequence_number());
            cookie.check().is_ok()
        }
        Err(_) => false,
    };
    if !named {
        debug!("Failed to name pixmap for {:#010x}", w.id);
        return false;
    }

    let vi = visuals.get(w.visual).unwrap_or(crate::backend::VisualInfo {
        visual: w.visual,
        depth: w.depth,
        has_alpha: w.has_alpha,
    });
    match backend.bind_pixmap(pixmap, vi, true) {
        Ok(img) => {
            if let Some(old) = w.image.take() {
                backend.release_image(old);
            }
            if let Some(old) = w.shadow_image.take() {
                backend.release_image(old);
            }
            w.image = Some(img);
            true
        }
        Err(e) => {
            debug!("Failed to bind pixmap of {:#010x}: {}", w.id, e);
            let _ = conn.free_pixmap(pixmap);
            false
        }
    }
}
