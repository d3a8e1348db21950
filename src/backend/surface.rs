// Window surfaces
//
// Builds a VkSurfaceKHR from raw-window-handle 0.6 handles for the window
// systems the loader supports.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{c_void, CStr};

use super::VulkanDevice;
use crate::rhi::WindowHandle;

/// Surface extensions to enable: the generic one plus every platform one
/// the installed loader exposes.
pub fn instance_extensions(entry: &Entry) -> Result<Vec<&'static CStr>> {
    let available = entry
        .enumerate_instance_extension_properties(None)
        .context("Failed to enumerate instance extensions")?;
    let is_available = |name: &CStr| {
        available
            .iter()
            .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == name)
    };

    let candidates = [
        khr::Surface::name(),
        khr::Win32Surface::name(),
        khr::XlibSurface::name(),
        khr::XcbSurface::name(),
        khr::WaylandSurface::name(),
    ];
    let enabled: Vec<_> = candidates.into_iter().filter(|name| is_available(name)).collect();

    if !enabled.contains(&khr::Surface::name()) {
        log::warn!("VK_KHR_surface unavailable, presentation will not work");
    }
    Ok(enabled)
}

pub fn create_surface(device: &VulkanDevice, window: &WindowHandle) -> Result<vk::SurfaceKHR> {
    let entry = &device.entry;
    let instance = &device.instance;

    let surface = match (window.display, window.window) {
        (_, RawWindowHandle::Win32(handle)) => {
            let hinstance = handle
                .hinstance
                .map_or(std::ptr::null(), |h| h.get() as *const c_void);
            let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                .hinstance(hinstance)
                .hwnd(handle.hwnd.get() as *const c_void);
            unsafe {
                khr::Win32Surface::new(entry, instance).create_win32_surface(&create_info, None)
            }
        }
        (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(handle)) => {
            let display = display.display.context("Xlib display handle is null")?;
            let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                .dpy(display.as_ptr().cast())
                .window(handle.window);
            unsafe {
                khr::XlibSurface::new(entry, instance).create_xlib_surface(&create_info, None)
            }
        }
        (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(handle)) => {
            let connection = display.connection.context("XCB connection is null")?;
            let create_info = vk::XcbSurfaceCreateInfoKHR::builder()
                .connection(connection.as_ptr())
                .window(handle.window.get());
            unsafe { khr::XcbSurface::new(entry, instance).create_xcb_surface(&create_info, None) }
        }
        (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(handle)) => {
            let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                .display(display.display.as_ptr())
                .surface(handle.surface.as_ptr());
            unsafe {
                khr::WaylandSurface::new(entry, instance).create_wayland_surface(&create_info, None)
            }
        }
        (display, window) => {
            anyhow::bail!("Unsupported window system: {:?} / {:?}", display, window)
        }
    };

    surface.context("Failed to create window surface")
}
