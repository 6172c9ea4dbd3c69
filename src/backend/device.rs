// Device context - core GPU interface
//
// Responsibilities:
// - Instance creation with best-effort validation layers
// - Surface creation bound to the window handle
// - Physical device selection (surface-compatible, prefer discrete GPU)
// - Logical device + graphics/present queue creation
//
// Created once, destroyed last, after every dependent resource.

use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{CStr, CString};
use std::sync::Arc;

use crate::error::{RenderError, RenderResult};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// The presentation surface together with its extension loader.
pub struct SurfaceBinding {
    pub loader: ash::khr::surface::Instance,
    pub surface: vk::SurfaceKHR,
}

/// Owns the instance, logical device, queues, and presentation surface.
pub struct DeviceContext {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,

    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub graphics_queue_family: u32,
    pub present_queue_family: u32,

    surface: Option<SurfaceBinding>,
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    _entry: Entry,
}

impl DeviceContext {
    /// Create the full device context bound to a window surface.
    ///
    /// Any failing step aborts initialization; no partial state escapes.
    pub fn new(
        app_name: &str,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        enable_validation: bool,
    ) -> RenderResult<Arc<Self>> {
        let entry = unsafe { Entry::load() }.map_err(|e| {
            RenderError::Init(format!("failed to load Vulkan library: {e}"))
        })?;

        let surface_extensions = ash_window::enumerate_required_extensions(display_handle)
            .map_err(|e| RenderError::Init(format!("no surface support for this display: {e}")))?;

        let with_validation = enable_validation && Self::validation_available(&entry);
        let instance = Self::create_instance(&entry, app_name, surface_extensions, with_validation)?;

        let debug_utils = if with_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);
        let surface = unsafe {
            ash_window::create_surface(&entry, &instance, display_handle, window_handle, None)
        }
        .map_err(|e| RenderError::Init(format!("failed to create window surface: {e}")))?;
        let surface_binding = SurfaceBinding {
            loader: surface_loader,
            surface,
        };

        let (physical_device, graphics_queue_family, present_queue_family) =
            Self::pick_physical_device(&instance, &surface_binding)?;

        let (device, graphics_queue, present_queue) = Self::create_logical_device(
            &instance,
            physical_device,
            graphics_queue_family,
            present_queue_family,
        )?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );

        Ok(Arc::new(Self {
            device,
            physical_device,
            instance,
            graphics_queue,
            present_queue,
            graphics_queue_family,
            present_queue_family,
            surface: Some(surface_binding),
            debug_utils,
            _entry: entry,
        }))
    }

    /// The surface this context presents to.
    ///
    /// Only absent for the surface-less contexts used by buffer tests.
    pub fn surface(&self) -> RenderResult<&SurfaceBinding> {
        self.surface
            .as_ref()
            .ok_or_else(|| RenderError::Init("device context has no surface".to_string()))
    }

    fn validation_available(entry: &Entry) -> bool {
        let layers = match unsafe { entry.enumerate_instance_layer_properties() } {
            Ok(layers) => layers,
            Err(_) => return false,
        };
        let found = layers.iter().any(|layer| {
            (unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) }) == VALIDATION_LAYER
        });
        if !found {
            log::warn!("Validation layers requested but not available, continuing without");
        }
        found
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        surface_extensions: &[*const std::os::raw::c_char],
        with_validation: bool,
    ) -> RenderResult<ash::Instance> {
        let app_name_cstr = CString::new(app_name)
            .map_err(|e| RenderError::Init(format!("invalid application name: {e}")))?;

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let mut extensions = surface_extensions.to_vec();

        // Validation is best-effort: missing layers degrade to a warning.
        let layer_names = if with_validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        unsafe { entry.create_instance(&create_info, None) }
            .map_err(|e| RenderError::Init(format!("failed to create Vulkan instance: {e}")))
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> RenderResult<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;

        Ok((debug_utils, messenger))
    }

    /// Pick a GPU with a graphics queue, a present-capable queue for the
    /// surface, and swapchain support. Discrete GPUs score highest.
    fn pick_physical_device(
        instance: &ash::Instance,
        surface: &SurfaceBinding,
    ) -> RenderResult<(vk::PhysicalDevice, u32, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            return Err(RenderError::Init("no Vulkan-capable GPU found".to_string()));
        }

        let mut best: Option<(vk::PhysicalDevice, u32, u32)> = None;
        let mut best_score = 0;

        for device in devices {
            if !Self::supports_swapchain(instance, device) {
                continue;
            }

            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };

            let graphics_family = queue_families
                .iter()
                .position(|props| props.queue_flags.contains(vk::QueueFlags::GRAPHICS))
                .map(|i| i as u32);

            let present_family = (0..queue_families.len() as u32).find(|&i| {
                unsafe {
                    surface.loader.get_physical_device_surface_support(
                        device,
                        i,
                        surface.surface,
                    )
                }
                .unwrap_or(false)
            });

            let (Some(graphics_family), Some(present_family)) = (graphics_family, present_family)
            else {
                continue;
            };

            let props = unsafe { instance.get_physical_device_properties(device) };
            let score = match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                _ => 1,
            };

            if score > best_score {
                best_score = score;
                best = Some((device, graphics_family, present_family));
            }
        }

        best.ok_or_else(|| {
            RenderError::Init("no GPU compatible with the window surface".to_string())
        })
    }

    fn supports_swapchain(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
        let extensions = match unsafe { instance.enumerate_device_extension_properties(device) } {
            Ok(extensions) => extensions,
            Err(_) => return false,
        };
        extensions.iter().any(|ext| {
            (unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) })
                == ash::khr::swapchain::NAME
        })
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        graphics_queue_family: u32,
        present_queue_family: u32,
    ) -> RenderResult<(ash::Device, vk::Queue, vk::Queue)> {
        let queue_priorities = [1.0];

        // One queue-create-info per distinct family; graphics and present
        // may alias.
        let mut queue_infos = vec![vk::DeviceQueueCreateInfo::default()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priorities)];
        if present_queue_family != graphics_queue_family {
            queue_infos.push(
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(present_queue_family)
                    .queue_priorities(&queue_priorities),
            );
        }

        let extensions = [ash::khr::swapchain::NAME.as_ptr()];

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .map_err(|e| RenderError::Init(format!("failed to create logical device: {e}")))?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };
        let present_queue = unsafe { device.get_device_queue(present_queue_family, 0) };

        Ok((device, graphics_queue, present_queue))
    }

    /// Wait for the device to go idle (swapchain rebuild, shutdown).
    pub fn wait_idle(&self) -> RenderResult<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }

    /// Surface-less context for buffer-layer tests. Returns `None` when no
    /// Vulkan implementation or GPU is present so tests can skip.
    #[cfg(test)]
    pub fn headless_for_tests() -> Option<Arc<Self>> {
        let entry = unsafe { Entry::load() }.ok()?;

        let app_info = vk::ApplicationInfo::default().api_version(vk::API_VERSION_1_3);
        let create_info = vk::InstanceCreateInfo::default().application_info(&app_info);
        let instance = unsafe { entry.create_instance(&create_info, None) }.ok()?;

        let devices = unsafe { instance.enumerate_physical_devices() }.ok()?;
        let (physical_device, graphics_queue_family) = devices.into_iter().find_map(|device| {
            let families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };
            families
                .iter()
                .position(|props| props.queue_flags.contains(vk::QueueFlags::GRAPHICS))
                .map(|i| (device, i as u32))
        })?;

        let queue_priorities = [1.0];
        let queue_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priorities)];
        let device_info = vk::DeviceCreateInfo::default().queue_create_infos(&queue_infos);
        let device =
            unsafe { instance.create_device(physical_device, &device_info, None) }.ok()?;
        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

        Some(Arc::new(Self {
            device,
            physical_device,
            instance,
            graphics_queue,
            present_queue: graphics_queue,
            graphics_queue_family,
            present_queue_family: graphics_queue_family,
            surface: None,
            debug_utils: None,
            _entry: entry,
        }))
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        log::info!("Destroying device context");

        let _ = self.wait_idle();

        unsafe {
            self.device.destroy_device(None);

            if let Some(binding) = self.surface.take() {
                binding.loader.destroy_surface(binding.surface, None);
            }

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
