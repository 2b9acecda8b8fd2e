//! Typed access to X window properties, shapes and event masks.

use anyhow::{Context, Result};
use tracing::debug;
use x11rb::connection::Connection;
use x11rb::protocol::render::{self, ConnectionExt as _};
use x11rb::protocol::shape::{self, ConnectionExt as _};
use x11rb::protocol::xproto::{Atom, AtomEnum, ConnectionExt as _, EventMask, PropMode};
use x11rb::wrapper::ConnectionExt as _;

use crate::backend::VisualInfo;
use crate::region::{Rect, Region};
use crate::win::{Margins, WinType, Xid};

/// All atoms the compositor touches, interned once at startup.
#[derive(Debug)]
pub struct Atoms {
    pub wm_state: Atom,
    pub net_wm_window_opacity: Atom,
    pub net_frame_extents: Atom,
    pub net_wm_name: Atom,
    pub wm_name: Atom,
    pub wm_class: Atom,
    pub wm_window_role: Atom,
    pub wm_transient_for: Atom,
    pub wm_client_leader: Atom,
    pub net_active_window: Atom,
    pub net_wm_window_type: Atom,
    pub compton_shadow: Atom,
    pub xrootpmap_id: Atom,
    pub xsetroot_id: Atom,
    pub esetroot_pmap_id: Atom,
    pub net_wm_pid: Atom,
    pub veil_version: Atom,
    pub utf8_string: Atom,
    /// The `_NET_WM_CM_Sn` selection for our screen.
    pub cm_selection: Atom,
    wintypes: Vec<(WinType, Atom)>,
}

impl Atoms {
    pub fn new(conn: &impl Connection, screen_num: usize) -> Result<Self> {
        let intern = |name: &str| -> Result<Atom> {
            Ok(conn.intern_atom(false, name.as_bytes())?.reply()?.atom)
        };

        let mut wintypes = Vec::new();
        for ty in WinType::ALL {
            if ty == WinType::Unknown {
                continue;
            }
            let name = format!("_NET_WM_WINDOW_TYPE_{}", ty.atom_suffix());
            wintypes.push((ty, intern(&name)?));
        }

        Ok(Self {
            wm_state: intern("WM_STATE")?,
            net_wm_window_opacity: intern("_NET_WM_WINDOW_OPACITY")?,
            net_frame_extents: intern("_NET_FRAME_EXTENTS")?,
            net_wm_name: intern("_NET_WM_NAME")?,
            wm_name: AtomEnum::WM_NAME.into(),
            wm_class: AtomEnum::WM_CLASS.into(),
            wm_window_role: intern("WM_WINDOW_ROLE")?,
            wm_transient_for: AtomEnum::WM_TRANSIENT_FOR.into(),
            wm_client_leader: intern("WM_CLIENT_LEADER")?,
            net_active_window: intern("_NET_ACTIVE_WINDOW")?,
            net_wm_window_type: intern("_NET_WM_WINDOW_TYPE")?,
            compton_shadow: intern("_COMPTON_SHADOW")?,
            xrootpmap_id: intern("_XROOTPMAP_ID")?,
            xsetroot_id: intern("_XSETROOT_ID")?,
            esetroot_pmap_id: intern("ESETROOT_PMAP_ID")?,
            net_wm_pid: intern("_NET_WM_PID")?,
            veil_version: intern("VEIL_VERSION")?,
            utf8_string: intern("UTF8_STRING")?,
            cm_selection: intern(&format!("_NET_WM_CM_S{}", screen_num))?,
            wintypes,
        })
    }

    pub fn wintype_of(&self, atom: Atom) -> Option<WinType> {
        self.wintypes
            .iter()
            .find(|(_, a)| *a == atom)
            .map(|(t, _)| *t)
    }

    /// Whether a property change can affect the window type.
    pub fn is_wintype_atom(&self, atom: Atom) -> bool {
        atom == self.net_wm_window_type || atom == self.wm_transient_for
    }
}

/// Read a single 32-bit cardinal.
pub fn get_cardinal(conn: &impl Connection, win: Xid, atom: Atom) -> Result<Option<u32>> {
    let reply = conn
        .get_property(false, win, atom, AtomEnum::ANY, 0, 1)?
        .reply()?;
    Ok(reply.value32().and_then(|mut it| it.next()))
}

/// Read up to `count` 32-bit values.
pub fn get_cardinals(
    conn: &impl Connection,
    win: Xid,
    atom: Atom,
    count: u32,
) -> Result<Vec<u32>> {
    let reply = conn
        .get_property(false, win, atom, AtomEnum::ANY, 0, count)?
        .reply()?;
    Ok(reply.value32().map(|it| it.collect()).unwrap_or_default())
}

/// Presence test without transferring the value.
pub fn has_prop(conn: &impl Connection, win: Xid, atom: Atom) -> bool {
    conn.get_property(false, win, atom, AtomEnum::ANY, 0, 0)
        .ok()
        .and_then(|c| c.reply().ok())
        .map(|r| r.type_ != 0)
        .unwrap_or(false)
}

/// `_NET_WM_WINDOW_OPACITY`, raw 32-bit value.
pub fn get_opacity_prop(conn: &impl Connection, atoms: &Atoms, win: Xid) -> Option<u32> {
    get_cardinal(conn, win, atoms.net_wm_window_opacity)
        .ok()
        .flatten()
}

pub fn set_opacity_prop(conn: &impl Connection, atoms: &Atoms, win: Xid, value: u32) -> Result<()> {
    conn.change_property32(
        PropMode::REPLACE,
        win,
        atoms.net_wm_window_opacity,
        AtomEnum::CARDINAL,
        &[value],
    )?;
    Ok(())
}

pub fn delete_opacity_prop(conn: &impl Connection, atoms: &Atoms, win: Xid) -> Result<()> {
    conn.delete_property(win, atoms.net_wm_window_opacity)?;
    Ok(())
}

/// `_NET_FRAME_EXTENTS`: left, right, top, bottom.
pub fn get_frame_extents(conn: &impl Connection, atoms: &Atoms, client: Xid) -> Margins {
    let vals = get_cardinals(conn, client, atoms.net_frame_extents, 4).unwrap_or_default();
    if vals.len() < 4 {
        return Margins::default();
    }
    Margins {
        left: vals[0] as i32,
        right: vals[1] as i32,
        top: vals[2] as i32,
        bottom: vals[3] as i32,
    }
}

/// `_NET_WM_WINDOW_TYPE`, first recognized entry wins. `None` when the
/// property is missing or carries no known type.
pub fn get_wintype_prop(conn: &impl Connection, atoms: &Atoms, client: Xid) -> Option<WinType> {
    let vals = get_cardinals(conn, client, atoms.net_wm_window_type, 32).ok()?;
    vals.iter().find_map(|a| atoms.wintype_of(*a))
}

fn get_text_prop(conn: &impl Connection, win: Xid, atom: Atom) -> Option<String> {
    let reply = conn
        .get_property(false, win, atom, AtomEnum::ANY, 0, u32::MAX)
        .ok()?
        .reply()
        .ok()?;
    if reply.format != 8 {
        return None;
    }
    Some(String::from_utf8_lossy(&reply.value).into_owned())
}

/// Window title, EWMH name preferred.
pub fn get_name(conn: &impl Connection, atoms: &Atoms, client: Xid) -> String {
    get_text_prop(conn, client, atoms.net_wm_name)
        .or_else(|| get_text_prop(conn, client, atoms.wm_name))
        .unwrap_or_default()
}

/// WM_CLASS: (instance, general class).
pub fn get_class(conn: &impl Connection, atoms: &Atoms, client: Xid) -> (String, String) {
    let Some(raw) = get_text_prop(conn, client, atoms.wm_class) else {
        return (String::new(), String::new());
    };
    let mut parts = raw.split('\0');
    let instance = parts.next().unwrap_or_default().to_owned();
    let general = parts.next().unwrap_or_default().to_owned();
    (instance, general)
}

pub fn get_role(conn: &impl Connection, atoms: &Atoms, client: Xid) -> String {
    get_text_prop(conn, client, atoms.wm_window_role).unwrap_or_default()
}

/// A WINDOW-typed property (transient-for, client leader).
pub fn get_window_prop(conn: &impl Connection, win: Xid, atom: Atom) -> Option<Xid> {
    get_cardinal(conn, win, atom).ok().flatten().filter(|w| *w != 0)
}

/// Leader detection: WM_CLIENT_LEADER wins over WM_TRANSIENT_FOR.
pub fn get_leader(conn: &impl Connection, atoms: &Atoms, client: Xid) -> Xid {
    get_window_prop(conn, client, atoms.wm_client_leader)
        .or_else(|| get_window_prop(conn, client, atoms.wm_transient_for))
        .unwrap_or(0)
}

/// Find the window holding WM_STATE in the subtree under `win`, depth
/// first, `win` itself included.
pub fn find_client_win(conn: &impl Connection, atoms: &Atoms, win: Xid) -> Option<Xid> {
    if has_prop(conn, win, atoms.wm_state) {
        return Some(win);
    }
    let tree = conn.query_tree(win).ok()?.reply().ok()?;
    for child in tree.children {
        if let Some(found) = find_client_win(conn, atoms, child) {
            return Some(found);
        }
    }
    None
}

/// Bounding shape in window-local coordinates, border offset included.
/// Falls back to the full rectangle when the Shape extension is absent or
/// the query fails.
pub fn get_bounding_shape(
    conn: &impl Connection,
    shape_exists: bool,
    win: Xid,
    border_width: u16,
    widthb: i32,
    heightb: i32,
) -> (Region, bool) {
    let full = Region::rect(0, 0, widthb, heightb);
    if !shape_exists {
        return (full, false);
    }
    let reply = match conn
        .shape_get_rectangles(win, shape::SK::BOUNDING)
        .map(|c| c.reply())
    {
        Ok(Ok(r)) => r,
        _ => return (full, false),
    };

    // Shape rectangles are relative to the window, not its border box.
    let bw = border_width as i32;
    let region = Region::from_rects(reply.rectangles.iter().map(|r| {
        Rect::new(
            r.x as i32 + bw,
            r.y as i32 + bw,
            r.width as i32,
            r.height as i32,
        )
    }));
    let shaped = region != full;
    debug!("Window {:#010x} bounding shaped: {}", win, shaped);
    (region, shaped)
}

/// Event interest on a toplevel frame or on the client window inside it.
pub fn frame_evmask() -> EventMask {
    EventMask::PROPERTY_CHANGE
}

pub fn client_evmask() -> EventMask {
    EventMask::PROPERTY_CHANGE
}

/// Per-visual render format info, resolved once at startup.
#[derive(Debug, Default)]
pub struct VisualFormats {
    map: std::collections::HashMap<u32, VisualInfo>,
}

impl VisualFormats {
    pub fn query(conn: &impl Connection) -> Result<Self> {
        let reply = conn
            .render_query_pict_formats()
            .context("Render extension did not answer pict format query")?
            .reply()?;

        let mut formats = std::collections::HashMap::new();
        for f in &reply.formats {
            formats.insert(f.id, f);
        }

        let mut map = std::collections::HashMap::new();
        for screen in &reply.screens {
            for depth in &screen.depths {
                for pv in &depth.visuals {
                    if let Some(f) = formats.get(&pv.format) {
                        map.insert(
                            pv.visual,
                            VisualInfo {
                                visual: pv.visual,
                                depth: f.depth,
                                has_alpha: f.type_ == render::PictType::DIRECT
                                    && f.direct.alpha_mask != 0,
                            },
                        );
                    }
                }
            }
        }
        Ok(Self { map })
    }

    pub fn get(&self, visual: u32) -> Option<VisualInfo> {
        self.map.get(&visual).copied()
    }
}
