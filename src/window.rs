use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tracing::{info, warn};
use windows::core::PCWSTR;
use windows::Win32::Foundation::*;
use windows::Win32::Graphics::Gdi::*;
use windows::Win32::System::LibraryLoader::GetModuleHandleW;
use windows::Win32::System::Threading::CreateMutexW;
use windows::Win32::UI::HiDpi::{
    SetProcessDpiAwarenessContext, DPI_AWARENESS_CONTEXT_PER_MONITOR_AWARE_V2,
};
use windows::Win32::UI::WindowsAndMessaging::*;

use crate::clock::SystemClock;
use crate::config::ConfigStore;
use crate::controller::{Controller, Phase};
use crate::fetcher::UsageSource;
use crate::models::PollEvent;
use crate::native_interop::{
    self, Color, TIMER_SESSION_CHECK, WM_APP_AUTH_INVALID, WM_APP_USAGE_UPDATED,
};
use crate::scheduler::EventSink;
use crate::theme;
use crate::usage::{Readout, Severity};

/// Wrapper to make HWND sendable across threads (safe for PostMessage usage)
#[derive(Clone, Copy)]
struct SendHwnd(isize);

unsafe impl Send for SendHwnd {}
unsafe impl Sync for SendHwnd {}

impl SendHwnd {
    fn from_hwnd(hwnd: HWND) -> Self {
        Self(hwnd.0 as isize)
    }
    fn to_hwnd(self) -> HWND {
        HWND(self.0 as *mut _)
    }
}

/// What the overlay currently shows. Only touched on the UI thread.
struct AppState {
    readout: Readout,
    status: String,
}

static STATE: Mutex<Option<AppState>> = Mutex::new(None);

/// Snapshots handed over by worker threads, drained on WM_APP_USAGE_UPDATED
static PENDING: Mutex<Vec<PollEvent>> = Mutex::new(Vec::new());

static CONTROLLER: OnceLock<Arc<Controller>> = OnceLock::new();

/// Lock STATE safely, recovering from poisoned mutex
fn lock_state() -> MutexGuard<'static, Option<AppState>> {
    STATE.lock().unwrap_or_else(|e| e.into_inner())
}

fn controller() -> Option<&'static Arc<Controller>> {
    CONTROLLER.get()
}

const WIDGET_WIDTH: i32 = 300;
const WIDGET_HEIGHT: i32 = 104;
const HEADER_HEIGHT: i32 = 28;
const PADDING: i32 = 8;
const BAR_HEIGHT: i32 = 12;

// Menu item IDs
const IDM_REFRESH: u16 = 1;
const IDM_EXIT: u16 = 2;
const IDM_LOGOUT: u16 = 3;
const IDM_SIGN_IN: u16 = 4;
const IDM_INTERVAL_BASE: u16 = 10;
const IDM_OPACITY_BASE: u16 = 30;

const INTERVAL_CHOICES: &[(u64, &str)] = &[
    (10, "10 Seconds"),
    (30, "30 Seconds"),
    (60, "1 Minute"),
    (300, "5 Minutes"),
];

/// Opacity menu steps in percent
const OPACITY_STEPS: &[u8] = &[30, 40, 50, 60, 70, 80, 90, 100];

/// How often a signed-out overlay looks for a newly saved session
const SESSION_CHECK_MS: u32 = 5_000;

const SIGNED_OUT_STATUS: &str = "Signed out - waiting for a saved session";
const NO_SESSION_STATUS: &str = "No saved session found";
const HINT_STATUS: &str = "Drag to move - right-click for options";

pub fn run(
    config: Arc<ConfigStore>,
    source: Arc<dyn UsageSource>,
) -> windows::core::Result<()> {
    // Single-instance guard: silently exit if another instance is running
    let mutex_name = native_interop::wide_str("Local\\ClaudeUsageBar");
    let _mutex = unsafe {
        let handle = CreateMutexW(None, false, PCWSTR::from_raw(mutex_name.as_ptr()))?;
        if GetLastError() == ERROR_ALREADY_EXISTS {
            info!("Another overlay is already running");
            return Ok(());
        }
        handle
    };

    unsafe {
        let _ = SetProcessDpiAwarenessContext(DPI_AWARENESS_CONTEXT_PER_MONITOR_AWARE_V2);
    }

    let class_name = native_interop::wide_str("ClaudeUsageBar");
    let settings = config.snapshot();

    let hwnd = unsafe {
        let hinstance = GetModuleHandleW(PCWSTR::null())?;

        let wc = WNDCLASSEXW {
            cbSize: std::mem::size_of::<WNDCLASSEXW>() as u32,
            style: CS_HREDRAW | CS_VREDRAW,
            lpfnWndProc: Some(wnd_proc),
            hInstance: HINSTANCE(hinstance.0),
            hCursor: LoadCursorW(HINSTANCE::default(), IDC_ARROW).unwrap_or_default(),
            hbrBackground: HBRUSH(std::ptr::null_mut()),
            lpszClassName: PCWSTR::from_raw(class_name.as_ptr()),
            ..Default::default()
        };

        RegisterClassExW(&wc);

        let title = native_interop::wide_str("Claude Usage");
        CreateWindowExW(
            WS_EX_TOOLWINDOW | WS_EX_LAYERED | WS_EX_TOPMOST,
            PCWSTR::from_raw(class_name.as_ptr()),
            PCWSTR::from_raw(title.as_ptr()),
            WS_POPUP,
            settings.position.x,
            settings.position.y,
            WIDGET_WIDTH,
            WIDGET_HEIGHT,
            HWND::default(),
            HMENU::default(),
            hinstance,
            None,
        )?
    };

    {
        let mut state = lock_state();
        *state = Some(AppState {
            readout: Readout::placeholder("Loading..."),
            status: HINT_STATUS.to_string(),
        });
    }

    let send_hwnd = SendHwnd::from_hwnd(hwnd);
    let sink: EventSink = Arc::new(move |event| {
        let msg = match event {
            PollEvent::Updated(_) => {
                PENDING
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(event);
                WM_APP_USAGE_UPDATED
            }
            PollEvent::AuthInvalid => WM_APP_AUTH_INVALID,
        };
        unsafe {
            let _ = PostMessageW(send_hwnd.to_hwnd(), msg, WPARAM(0), LPARAM(0));
        }
    });

    let controller = Arc::new(Controller::new(
        config,
        source,
        Arc::new(SystemClock::new()),
        sink,
    ));
    let _ = CONTROLLER.set(controller.clone());

    native_interop::set_opacity(hwnd, settings.opacity);
    native_interop::set_topmost(hwnd);
    unsafe {
        let _ = ShowWindow(hwnd, SW_SHOWNOACTIVATE);
    }

    if controller.start() == Phase::SignedOut {
        set_signed_out(hwnd);
    }
    invalidate(hwnd);

    // Message loop
    unsafe {
        let mut msg = MSG::default();
        while GetMessageW(&mut msg, HWND::default(), 0, 0).as_bool() {
            let _ = TranslateMessage(&msg);
            DispatchMessageW(&msg);
        }
    }

    controller.stop();
    Ok(())
}

fn invalidate(hwnd: HWND) {
    unsafe {
        let _ = InvalidateRect(hwnd, None, false);
    }
}

/// Show the signed-out state and start watching the config for a session
fn set_signed_out(hwnd: HWND) {
    set_status(SIGNED_OUT_STATUS);
    {
        let mut state = lock_state();
        if let Some(s) = state.as_mut() {
            s.readout = Readout::placeholder("Sign-in required");
        }
    }
    unsafe {
        SetTimer(hwnd, TIMER_SESSION_CHECK, SESSION_CHECK_MS, None);
    }
}

fn set_status(status: &str) {
    let mut state = lock_state();
    if let Some(s) = state.as_mut() {
        s.status = status.to_string();
    }
}

/// Resume polling if a session has been saved since we signed out
fn try_resume(hwnd: HWND) -> bool {
    let Some(controller) = controller() else {
        return false;
    };
    if controller.reload_session() == Phase::SignedOut {
        return false;
    }

    unsafe {
        let _ = KillTimer(hwnd, TIMER_SESSION_CHECK);
    }
    {
        let mut state = lock_state();
        if let Some(s) = state.as_mut() {
            s.readout = Readout::placeholder("Loading...");
            s.status = HINT_STATUS.to_string();
        }
    }
    invalidate(hwnd);
    true
}

/// Apply snapshots queued by worker threads; the newest one wins
fn drain_pending() {
    let events: Vec<PollEvent> =
        std::mem::take(&mut *PENDING.lock().unwrap_or_else(|e| e.into_inner()));
    let latest = events.into_iter().rev().find_map(|e| match e {
        PollEvent::Updated(snapshot) => Some(snapshot),
        PollEvent::AuthInvalid => None,
    });

    if let Some(snapshot) = latest {
        let mut state = lock_state();
        if let Some(s) = state.as_mut() {
            s.readout = Readout::from_snapshot(&snapshot);
            s.status = HINT_STATUS.to_string();
        }
    }
}

fn on_auth_invalid(hwnd: HWND) {
    let Some(controller) = controller() else {
        return;
    };
    set_status("Session expired");
    invalidate(hwnd);

    let relogin = native_interop::confirm(
        hwnd,
        "Session Expired",
        "Your session has expired. Would you like to log in again?",
    );
    if controller.resolve_auth_invalid(relogin) == Phase::SignedOut {
        set_signed_out(hwnd);
    }
    invalidate(hwnd);
}

fn on_command(hwnd: HWND, id: u16) {
    let Some(controller) = controller() else {
        return;
    };

    match id {
        IDM_REFRESH => {
            controller.refresh();
        }
        IDM_SIGN_IN => {
            if !try_resume(hwnd) {
                set_status(NO_SESSION_STATUS);
                invalidate(hwnd);
            }
        }
        IDM_LOGOUT => {
            if native_interop::confirm(hwnd, "Logout", "Log out and clear session?") {
                controller.sign_out();
                set_signed_out(hwnd);
                invalidate(hwnd);
            }
        }
        IDM_EXIT => {
            controller.stop();
            unsafe {
                let _ = DestroyWindow(hwnd);
            }
        }
        id if (IDM_INTERVAL_BASE..IDM_INTERVAL_BASE + INTERVAL_CHOICES.len() as u16)
            .contains(&id) =>
        {
            let (secs, _) = INTERVAL_CHOICES[(id - IDM_INTERVAL_BASE) as usize];
            let applied = controller.config().set_poll_interval(secs);
            info!("Poll interval set to {applied}s");
        }
        id if (IDM_OPACITY_BASE..IDM_OPACITY_BASE + OPACITY_STEPS.len() as u16).contains(&id) => {
            let pct = OPACITY_STEPS[(id - IDM_OPACITY_BASE) as usize];
            let applied = controller.config().set_opacity(f64::from(pct) / 100.0);
            native_interop::set_opacity(hwnd, applied);
        }
        _ => {}
    }
}

/// Main window procedure
unsafe extern "system" fn wnd_proc(
    hwnd: HWND,
    msg: u32,
    wparam: WPARAM,
    lparam: LPARAM,
) -> LRESULT {
    match msg {
        WM_PAINT => {
            let mut ps = PAINTSTRUCT::default();
            let hdc = BeginPaint(hwnd, &mut ps);
            paint(hdc, hwnd);
            let _ = EndPaint(hwnd, &ps);
            LRESULT(0)
        }
        WM_ERASEBKGND => LRESULT(1),
        WM_LBUTTONDOWN => {
            native_interop::begin_drag(hwnd);
            LRESULT(0)
        }
        WM_EXITSIZEMOVE => {
            if let (Some(rect), Some(controller)) =
                (native_interop::get_window_rect_safe(hwnd), controller())
            {
                controller.config().set_position(rect.left, rect.top);
            }
            LRESULT(0)
        }
        WM_APP_USAGE_UPDATED => {
            drain_pending();
            invalidate(hwnd);
            LRESULT(0)
        }
        WM_TIMER => {
            if wparam.0 == TIMER_SESSION_CHECK {
                try_resume(hwnd);
            }
            LRESULT(0)
        }
        WM_APP_AUTH_INVALID => {
            on_auth_invalid(hwnd);
            LRESULT(0)
        }
        WM_RBUTTONUP => {
            show_context_menu(hwnd);
            LRESULT(0)
        }
        WM_COMMAND => {
            on_command(hwnd, wparam.0 as u16);
            LRESULT(0)
        }
        WM_DESTROY => {
            if let Some(controller) = controller() {
                controller.stop();
            }
            PostQuitMessage(0);
            LRESULT(0)
        }
        _ => DefWindowProcW(hwnd, msg, wparam, lparam),
    }
}

fn show_context_menu(hwnd: HWND) {
    let Some(controller) = controller() else {
        return;
    };
    let settings = controller.config().snapshot();
    let signed_in = controller.phase() != Phase::SignedOut;

    unsafe {
        let Ok(menu) = CreatePopupMenu() else {
            warn!("Failed to create context menu");
            return;
        };

        append_item(menu, IDM_REFRESH, "Refresh", !signed_in, false);
        append_item(menu, IDM_SIGN_IN, "Sign In", signed_in, false);

        let Ok(settings_menu) = CreatePopupMenu() else {
            let _ = DestroyMenu(menu);
            return;
        };

        if let Ok(interval_menu) = CreatePopupMenu() {
            for (i, &(secs, label)) in INTERVAL_CHOICES.iter().enumerate() {
                let checked = secs == settings.poll_interval;
                append_item(interval_menu, IDM_INTERVAL_BASE + i as u16, label, false, checked);
            }
            append_submenu(settings_menu, interval_menu, "Update Interval");
        }

        if let Ok(opacity_menu) = CreatePopupMenu() {
            let current = (settings.opacity * 100.0).round() as u8;
            for (i, &pct) in OPACITY_STEPS.iter().enumerate() {
                let label = format!("{pct}%");
                append_item(opacity_menu, IDM_OPACITY_BASE + i as u16, &label, false, pct == current);
            }
            append_submenu(settings_menu, opacity_menu, "Opacity");
        }

        let _ = AppendMenuW(settings_menu, MF_SEPARATOR, 0, PCWSTR::null());
        append_item(settings_menu, IDM_LOGOUT, "Logout", !signed_in, false);

        let version_str = native_interop::wide_str(&format!("v{}", env!("CARGO_PKG_VERSION")));
        let _ = AppendMenuW(
            settings_menu,
            MF_GRAYED,
            0,
            PCWSTR::from_raw(version_str.as_ptr()),
        );

        append_submenu(menu, settings_menu, "Settings");
        let _ = AppendMenuW(menu, MF_SEPARATOR, 0, PCWSTR::null());
        append_item(menu, IDM_EXIT, "Close", false, false);

        let mut pt = POINT::default();
        let _ = GetCursorPos(&mut pt);
        let _ = SetForegroundWindow(hwnd);
        let _ = TrackPopupMenu(menu, TPM_RIGHTBUTTON, pt.x, pt.y, 0, hwnd, None);
        let _ = DestroyMenu(menu);
    }
}

unsafe fn append_item(menu: HMENU, id: u16, label: &str, grayed: bool, checked: bool) {
    let label = native_interop::wide_str(label);
    let mut flags = MF_STRING;
    if grayed {
        flags |= MF_GRAYED;
    }
    if checked {
        flags |= MF_CHECKED;
    }
    let _ = AppendMenuW(menu, flags, id as usize, PCWSTR::from_raw(label.as_ptr()));
}

unsafe fn append_submenu(menu: HMENU, submenu: HMENU, label: &str) {
    let label = native_interop::wide_str(label);
    let _ = AppendMenuW(
        menu,
        MF_POPUP,
        submenu.0 as usize,
        PCWSTR::from_raw(label.as_ptr()),
    );
}

/// Double-buffered WM_PAINT
fn paint(hdc: HDC, hwnd: HWND) {
    let (readout, status) = {
        let state = lock_state();
        match state.as_ref() {
            Some(s) => (s.readout.clone(), s.status.clone()),
            None => return,
        }
    };

    unsafe {
        let mut client_rect = RECT::default();
        let _ = GetClientRect(hwnd, &mut client_rect);
        let width = client_rect.right - client_rect.left;
        let height = client_rect.bottom - client_rect.top;

        if width <= 0 || height <= 0 {
            return;
        }

        let mem_dc = CreateCompatibleDC(hdc);
        let mem_bmp = CreateCompatibleBitmap(hdc, width, height);
        let old_bmp = SelectObject(mem_dc, mem_bmp);

        paint_content(mem_dc, width, height, &readout, &status);

        let _ = BitBlt(hdc, 0, 0, width, height, mem_dc, 0, 0, SRCCOPY);

        SelectObject(mem_dc, old_bmp);
        let _ = DeleteObject(mem_bmp);
        let _ = DeleteDC(mem_dc);
    }
}

fn paint_content(hdc: HDC, width: i32, height: i32, readout: &Readout, status: &str) {
    let bg = Color::from_hex(theme::BACKGROUND);
    let header = Color::from_hex(theme::HEADER);
    let track = Color::from_hex(theme::TRACK);
    let fill = Color::from_hex(theme::bar_color(readout.severity));

    unsafe {
        fill_rect(hdc, &RECT { left: 0, top: 0, right: width, bottom: height }, &bg);
        fill_rect(
            hdc,
            &RECT {
                left: 0,
                top: 0,
                right: width,
                bottom: HEADER_HEIGHT,
            },
            &header,
        );

        let _ = SetBkMode(hdc, TRANSPARENT);

        let bold = create_font(-12, FW_BOLD.0 as i32);
        let regular = create_font(-12, FW_NORMAL.0 as i32);
        let small = create_font(-10, FW_NORMAL.0 as i32);

        let old_font = SelectObject(hdc, bold);
        draw_text(hdc, "Claude Usage", PADDING, 0, width - PADDING, HEADER_HEIGHT, theme::BRAND);

        let row_y = HEADER_HEIGHT + 6;
        SelectObject(hdc, regular);
        let text_color = match readout.severity {
            Severity::Normal => theme::TEXT,
            other => theme::bar_color(other),
        };
        draw_text(hdc, &readout.text, PADDING, row_y, width - PADDING, row_y + 18, text_color);

        let bar_y = row_y + 24;
        let bar_right = width - PADDING;
        fill_rect(
            hdc,
            &RECT {
                left: PADDING,
                top: bar_y,
                right: bar_right,
                bottom: bar_y + BAR_HEIGHT,
            },
            &track,
        );
        let fill_width =
            ((bar_right - PADDING) as f64 * readout.percentage.clamp(0.0, 100.0) / 100.0) as i32;
        if fill_width > 0 {
            fill_rect(
                hdc,
                &RECT {
                    left: PADDING,
                    top: bar_y,
                    right: PADDING + fill_width,
                    bottom: bar_y + BAR_HEIGHT,
                },
                &fill,
            );
        }

        SelectObject(hdc, small);
        let status_y = bar_y + BAR_HEIGHT + 4;
        draw_text(hdc, status, PADDING, status_y, width - PADDING, height, theme::MUTED);

        SelectObject(hdc, old_font);
        let _ = DeleteObject(bold);
        let _ = DeleteObject(regular);
        let _ = DeleteObject(small);
    }
}

unsafe fn create_font(height: i32, weight: i32) -> HFONT {
    let font_name = native_interop::wide_str("Segoe UI");
    CreateFontW(
        height,
        0,
        0,
        0,
        weight,
        0,
        0,
        0,
        DEFAULT_CHARSET.0 as u32,
        OUT_TT_PRECIS.0 as u32,
        CLIP_DEFAULT_PRECIS.0 as u32,
        CLEARTYPE_QUALITY.0 as u32,
        (DEFAULT_PITCH.0 | FF_DONTCARE.0) as u32,
        PCWSTR::from_raw(font_name.as_ptr()),
    )
}

unsafe fn fill_rect(hdc: HDC, rect: &RECT, color: &Color) {
    let brush = CreateSolidBrush(COLORREF(color.to_colorref()));
    FillRect(hdc, rect, brush);
    let _ = DeleteObject(brush);
}

unsafe fn draw_text(hdc: HDC, text: &str, left: i32, top: i32, right: i32, bottom: i32, hex: &str) {
    let _ = SetTextColor(hdc, COLORREF(Color::from_hex(hex).to_colorref()));
    let mut wide: Vec<u16> = text.encode_utf16().collect();
    let mut rect = RECT {
        left,
        top,
        right,
        bottom,
    };
    let _ = DrawTextW(
        hdc,
        &mut wide,
        &mut rect,
        DT_LEFT | DT_VCENTER | DT_SINGLELINE | DT_END_ELLIPSIS,
    );
}
