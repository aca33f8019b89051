// Platform surfaces
//
// Maps raw window handles to the matching VK_KHR_*_surface extension.
// Supported: Win32, Xlib, Xcb, Wayland.

use anyhow::{bail, Context, Result};
use ash::extensions::khr;
use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::c_char;

/// Instance extensions needed to present to a window on this display
pub fn required_extensions(display: RawDisplayHandle) -> Result<Vec<*const c_char>> {
    let platform = match display {
        RawDisplayHandle::Windows(_) => khr::Win32Surface::name(),
        RawDisplayHandle::Xlib(_) => khr::XlibSurface::name(),
        RawDisplayHandle::Xcb(_) => khr::XcbSurface::name(),
        RawDisplayHandle::Wayland(_) => khr::WaylandSurface::name(),
        other => bail!("Unsupported display platform: {:?}", other),
    };

    Ok(vec![khr::Surface::name().as_ptr(), platform.as_ptr()])
}

/// Create a presentable surface for `window`
///
/// # Safety
/// The handles must stay valid for the lifetime of the returned surface.
pub unsafe fn create_surface(
    entry: &Entry,
    instance: &ash::Instance,
    display: RawDisplayHandle,
    window: RawWindowHandle,
) -> Result<vk::SurfaceKHR> {
    let surface = match (display, window) {
        (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
            let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                .hinstance(handle.hinstance.map_or(0, |h| h.get()) as vk::HINSTANCE)
                .hwnd(handle.hwnd.get() as vk::HWND);
            khr::Win32Surface::new(entry, instance).create_win32_surface(&create_info, None)
        }
        (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(handle)) => {
            let dpy = display
                .display
                .context("Xlib display handle has no connection")?;
            let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                .dpy(dpy.as_ptr().cast())
                .window(handle.window as vk::Window);
            khr::XlibSurface::new(entry, instance).create_xlib_surface(&create_info, None)
        }
        (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(handle)) => {
            let connection = display
                .connection
                .context("Xcb display handle has no connection")?;
            let create_info = vk::XcbSurfaceCreateInfoKHR::builder()
                .connection(connection.as_ptr().cast())
                .window(handle.window.get() as vk::xcb_window_t);
            khr::XcbSurface::new(entry, instance).create_xcb_surface(&create_info, None)
        }
        (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(handle)) => {
            let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                .display(display.display.as_ptr().cast())
                .surface(handle.surface.as_ptr().cast());
            khr::WaylandSurface::new(entry, instance).create_wayland_surface(&create_info, None)
        }
        (display, window) => bail!("Unsupported window platform: {:?} / {:?}", display, window),
    };

    surface.context("Failed to create window surface")
}
