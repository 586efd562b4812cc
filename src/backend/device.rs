// Graphics context - Core GPU interface
//
// Responsibilities:
// - Instance creation with optional validation layers + debug messenger
// - Window surface creation
// - Physical device selection (explicit override, else largest device-local memory)
// - Logical device + graphics queue creation

use anyhow::{Context, Result};
use ash::{vk, Entry};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::{c_void, CStr, CString};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Minimum Vulkan API version a device must report.
pub const MIN_API_VERSION: u32 = vk::API_VERSION_1_3;

const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Parameters for bringing up a graphics context.
#[derive(Debug, Clone)]
pub struct ContextDesc<'a> {
    pub app_name: &'a str,
    pub app_version: u32,
    pub enable_validation: bool,
    /// Abort on error-severity validation messages in debug builds.
    pub fatal_validation_errors: bool,
    /// Index into the enumerated device list.
    pub gpu_override: Option<usize>,
}

/// What device selection needs to know about one physical device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCandidate {
    pub name: String,
    pub api_version: u32,
    /// Supports every feature listed in `RequiredFeatures`.
    pub meets_features: bool,
    /// First queue family with graphics support that can present to the surface.
    pub queue_family: Option<u32>,
    /// Sum of all device-local memory heaps.
    pub device_local_bytes: u64,
}

impl DeviceCandidate {
    pub fn is_eligible(&self, min_api_version: u32) -> bool {
        self.api_version >= min_api_version && self.meets_features && self.queue_family.is_some()
    }
}

/// Pick a device index from `candidates`.
///
/// A valid override (in range and eligible) always wins. Otherwise the
/// eligible device with the largest device-local memory is chosen; ties keep
/// the earliest in enumeration order.
pub fn select_device(
    candidates: &[DeviceCandidate],
    gpu_override: Option<usize>,
    min_api_version: u32,
) -> Result<usize> {
    if let Some(index) = gpu_override {
        match candidates.get(index) {
            Some(candidate) if candidate.is_eligible(min_api_version) => {
                log::info!("Using GPU override {}: {}", index, candidate.name);
                return Ok(index);
            }
            Some(candidate) => log::warn!(
                "GPU override {} ({}) does not meet the requirements, falling back to automatic selection",
                index,
                candidate.name
            ),
            None => log::warn!(
                "GPU override {} is out of range ({} devices), falling back to automatic selection",
                index,
                candidates.len()
            ),
        }
    }

    let mut best: Option<(usize, u64)> = None;
    for (index, candidate) in candidates.iter().enumerate() {
        if !candidate.is_eligible(min_api_version) {
            continue;
        }
        if best.map_or(true, |(_, bytes)| candidate.device_local_bytes > bytes) {
            best = Some((index, candidate.device_local_bytes));
        }
    }

    match best {
        Some((index, _)) => Ok(index),
        None => {
            let found = candidates
                .iter()
                .map(|c| format!("{} (Vulkan {})", c.name, format_version(c.api_version)))
                .collect::<Vec<_>>();
            anyhow::bail!(
                "No GPU supports Vulkan {} with dynamic rendering, synchronization2, buffer device \
                 address, descriptor indexing and presentation to this window. Found: [{}]",
                format_version(min_api_version),
                found.join(", ")
            )
        }
    }
}

/// Sum the sizes of the device-local heaps.
pub fn device_local_heap_bytes(memory: &vk::PhysicalDeviceMemoryProperties) -> u64 {
    let count = (memory.memory_heap_count as usize).min(memory.memory_heaps.len());
    memory.memory_heaps[..count]
        .iter()
        .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|heap| heap.size)
        .sum()
}

pub fn format_version(version: u32) -> String {
    format!(
        "{}.{}.{}",
        vk::api_version_major(version),
        vk::api_version_minor(version),
        vk::api_version_patch(version)
    )
}

// =============================================================================
// DEBUG MESSENGER
// =============================================================================

struct MessengerState {
    fatal_errors: bool,
    error_count: AtomicU32,
}

struct DebugMessenger {
    loader: ash::ext::debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
    // Referenced by the driver through p_user_data until the messenger is destroyed
    state: Box<MessengerState>,
}

/// Instance-level objects: loader, instance, debug messenger, surface.
///
/// Dropping it tears these down in reverse creation order, so a failure
/// part-way through context creation still releases what was made.
struct InstanceLayer {
    debug: Option<DebugMessenger>,
    surface_loader: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    instance: ash::Instance,
    entry: Entry,
}

impl Drop for InstanceLayer {
    fn drop(&mut self) {
        unsafe {
            if self.surface != vk::SurfaceKHR::null() {
                self.surface_loader.destroy_surface(self.surface, None);
                self.surface = vk::SurfaceKHR::null();
            }
            if let Some(debug) = self.debug.take() {
                debug
                    .loader
                    .destroy_debug_utils_messenger(debug.messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

// =============================================================================
// GRAPHICS CONTEXT
// =============================================================================

/// Instance, surface, selected physical device, logical device and graphics
/// queue. Built once, shared by `Arc` with every other component, and
/// destroyed after all of them.
pub struct GraphicsContext {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,
    pub properties: vk::PhysicalDeviceProperties,
    device_names: Vec<String>,
    selected_index: usize,
    // Dropped after the device (see Drop below)
    instance: InstanceLayer,
}

impl GraphicsContext {
    /// Create the context for a window.
    pub fn new<W>(window: &W, desc: &ContextDesc<'_>) -> Result<Arc<Self>>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        log::info!("Creating graphics context: {}", desc.app_name);

        let display_handle = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let window_handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Step 2: Instance (+ messenger)
        let validation = desc.enable_validation && validation_layer_available(&entry);
        if desc.enable_validation && !validation {
            log::warn!("Validation layers requested but not available");
        }

        let instance = create_instance(&entry, desc, display_handle, validation)?;
        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);
        let mut layer = InstanceLayer {
            debug: None,
            surface_loader,
            surface: vk::SurfaceKHR::null(),
            instance,
            entry,
        };

        if validation {
            layer.debug = Some(create_debug_messenger(
                &layer.entry,
                &layer.instance,
                desc.fatal_validation_errors,
            )?);
        }

        // Step 3: Surface
        layer.surface = unsafe {
            ash_window::create_surface(
                &layer.entry,
                &layer.instance,
                display_handle,
                window_handle,
                None,
            )
        }
        .context("Failed to create window surface")?;

        // Step 4: Pick physical device
        let physical_devices = unsafe { layer.instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;

        let candidates = physical_devices
            .iter()
            .map(|&pd| probe_device(&layer, pd))
            .collect::<Vec<_>>();

        for (index, candidate) in candidates.iter().enumerate() {
            log::info!(
                "GPU {}: {} (Vulkan {}, {} MiB device-local{})",
                index,
                candidate.name,
                format_version(candidate.api_version),
                candidate.device_local_bytes / (1024 * 1024),
                if candidate.is_eligible(MIN_API_VERSION) { "" } else { ", unsupported" }
            );
        }

        let selected_index = select_device(&candidates, desc.gpu_override, MIN_API_VERSION)?;
        let physical_device = physical_devices[selected_index];
        let graphics_queue_family = candidates[selected_index]
            .queue_family
            .context("Selected GPU has no graphics queue")?;

        // Step 5: Logical device
        let device = create_logical_device(&layer.instance, physical_device, graphics_queue_family)?;
        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

        let properties = unsafe { layer.instance.get_physical_device_properties(physical_device) };

        let context = Self {
            device,
            physical_device,
            graphics_queue,
            graphics_queue_family,
            properties,
            device_names: candidates.into_iter().map(|c| c.name).collect(),
            selected_index,
            instance: layer,
        };
        context.log_device_info();

        Ok(Arc::new(context))
    }

    fn log_device_info(&self) {
        log::info!(
            "Chosen GPU: {}\n\tDriver Version: {}\n\tAPI Version: {}",
            self.device_names[self.selected_index],
            format_version(self.properties.driver_version),
            format_version(self.properties.api_version)
        );
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance.instance
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.instance.surface
    }

    pub fn surface_loader(&self) -> &ash::khr::surface::Instance {
        &self.instance.surface_loader
    }

    /// Names of every enumerated device, for a device picker.
    pub fn device_names(&self) -> &[String] {
        &self.device_names
    }

    pub fn selected_device_index(&self) -> usize {
        self.selected_index
    }

    /// Error-severity validation messages seen so far.
    pub fn validation_error_count(&self) -> u32 {
        self.instance
            .debug
            .as_ref()
            .map_or(0, |debug| debug.state.error_count.load(Ordering::Relaxed))
    }

    /// Block until the device has finished all submitted work.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("vkDeviceWaitIdle failed")?;
        Ok(())
    }
}

impl Drop for GraphicsContext {
    fn drop(&mut self) {
        log::info!("Destroying graphics context...");

        let _ = self.wait_idle();
        unsafe {
            self.device.destroy_device(None);
        }
        // InstanceLayer drops next: surface, messenger, instance
    }
}

fn validation_layer_available(entry: &Entry) -> bool {
    let Ok(layers) = (unsafe { entry.enumerate_instance_layer_properties() }) else {
        return false;
    };
    layers.iter().any(|layer| {
        (unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) }) == VALIDATION_LAYER_NAME
    })
}

fn create_instance(
    entry: &Entry,
    desc: &ContextDesc<'_>,
    display_handle: raw_window_handle::RawDisplayHandle,
    validation: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(desc.app_name)?;
    let engine_name = CString::new(env!("CARGO_PKG_NAME"))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(desc.app_version)
        .engine_name(&engine_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(MIN_API_VERSION);

    // Platform surface extensions
    let mut extensions = ash_window::enumerate_required_extensions(display_handle)
        .context("Unsupported window system")?
        .to_vec();
    if validation {
        extensions.push(ash::ext::debug_utils::NAME.as_ptr());
    }

    let layer_names = if validation {
        vec![VALIDATION_LAYER_NAME.as_ptr()]
    } else {
        vec![]
    };

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layer_names);

    unsafe { entry.create_instance(&create_info, None) }.context("Failed to create Vulkan instance")
}

fn create_debug_messenger(
    entry: &Entry,
    instance: &ash::Instance,
    fatal_errors: bool,
) -> Result<DebugMessenger> {
    let loader = ash::ext::debug_utils::Instance::new(entry, instance);
    let state = Box::new(MessengerState {
        fatal_errors,
        error_count: AtomicU32::new(0),
    });

    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback))
        .user_data(&*state as *const MessengerState as *mut c_void);

    let messenger = unsafe { loader.create_debug_utils_messenger(&create_info, None) }
        .context("Failed to create debug messenger")?;

    Ok(DebugMessenger {
        loader,
        messenger,
        state,
    })
}

/// Describe one physical device. Query failures make it ineligible rather
/// than aborting selection.
fn probe_device(layer: &InstanceLayer, physical_device: vk::PhysicalDevice) -> DeviceCandidate {
    let instance = &layer.instance;
    let properties = unsafe { instance.get_physical_device_properties(physical_device) };
    let memory = unsafe { instance.get_physical_device_memory_properties(physical_device) };
    let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
        .to_string_lossy()
        .into_owned();

    let meets_features = properties.api_version >= MIN_API_VERSION
        && RequiredFeatures::query(instance, physical_device).all_supported();

    let families = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    let queue_family = find_present_queue_family(&families, |index| unsafe {
        layer
            .surface_loader
            .get_physical_device_surface_support(physical_device, index, layer.surface)
    })
    .unwrap_or_else(|e| {
        log::warn!("Failed to query surface support on {}: {}", name, e);
        None
    });

    DeviceCandidate {
        name,
        api_version: properties.api_version,
        meets_features,
        queue_family,
        device_local_bytes: device_local_heap_bytes(&memory),
    }
}

/// First graphics queue family that can present. An error from the support
/// query ends the search.
pub fn find_present_queue_family<F>(
    families: &[vk::QueueFamilyProperties],
    mut supports_present: F,
) -> Result<Option<u32>, vk::Result>
where
    F: FnMut(u32) -> Result<bool, vk::Result>,
{
    for (index, family) in families.iter().enumerate() {
        let index = index as u32;
        if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) && supports_present(index)? {
            return Ok(Some(index));
        }
    }
    Ok(None)
}

/// Vulkan 1.2 / 1.3 features the renderer relies on.
#[derive(Debug, Default, Clone, Copy)]
struct RequiredFeatures {
    buffer_device_address: bool,
    descriptor_indexing: bool,
    dynamic_rendering: bool,
    synchronization2: bool,
}

impl RequiredFeatures {
    fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
        {
            let mut features2 = vk::PhysicalDeviceFeatures2::default()
                .push_next(&mut features12)
                .push_next(&mut features13);
            unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };
        }

        Self {
            buffer_device_address: features12.buffer_device_address == vk::TRUE,
            descriptor_indexing: features12.descriptor_indexing == vk::TRUE,
            dynamic_rendering: features13.dynamic_rendering == vk::TRUE,
            synchronization2: features13.synchronization2 == vk::TRUE,
        }
    }

    fn all_supported(&self) -> bool {
        self.buffer_device_address
            && self.descriptor_indexing
            && self.dynamic_rendering
            && self.synchronization2
    }
}

fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    graphics_queue_family: u32,
) -> Result<ash::Device> {
    let queue_priorities = [1.0];
    let queue_create_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(graphics_queue_family)
        .queue_priorities(&queue_priorities);

    let extensions = [ash::khr::swapchain::NAME.as_ptr()];

    let mut features12 = vk::PhysicalDeviceVulkan12Features::default()
        .buffer_device_address(true)
        .descriptor_indexing(true);
    let mut features13 = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(true)
        .synchronization2(true);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(std::slice::from_ref(&queue_create_info))
        .enabled_extension_names(&extensions)
        .push_next(&mut features12)
        .push_next(&mut features13);

    unsafe { instance.create_device(physical_device, &create_info, None) }
        .context("Failed to create logical device")
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    p_user_data: *mut c_void,
) -> vk::Bool32 {
    let message = if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        std::borrow::Cow::Borrowed("(no message)")
    } else {
        CStr::from_ptr((*p_callback_data).p_message).to_string_lossy()
    };

    let kind = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "Validation",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "Performance",
        _ => "General",
    };

    if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[Vulkan {}] {}", kind, message);

        if let Some(state) = (p_user_data as *const MessengerState).as_ref() {
            state.error_count.fetch_add(1, Ordering::Relaxed);
            if state.fatal_errors && cfg!(debug_assertions) {
                log::error!("Aborting on validation error");
                log::logger().flush();
                std::process::abort();
            }
        }
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("[Vulkan {}] {}", kind, message);
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        log::info!("[Vulkan {}] {}", kind, message);
    } else {
        log::trace!("[Vulkan {}] {}", kind, message);
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn candidate(name: &str, device_local_mib: u64) -> DeviceCandidate {
        DeviceCandidate {
            name: name.to_string(),
            api_version: vk::API_VERSION_1_3,
            meets_features: true,
            queue_family: Some(0),
            device_local_bytes: device_local_mib * MIB,
        }
    }

    #[test]
    fn single_device_is_selected() {
        let candidates = [candidate("Test GPU", 256)];
        let index = select_device(&candidates, None, MIN_API_VERSION).unwrap();
        assert_eq!(index, 0);
        assert_eq!(candidates[index].name, "Test GPU");
    }

    #[test]
    fn largest_device_local_memory_wins() {
        let candidates = [
            candidate("Integrated", 512),
            candidate("Discrete", 8192),
            candidate("Other", 4096),
        ];
        assert_eq!(select_device(&candidates, None, MIN_API_VERSION).unwrap(), 1);
    }

    #[test]
    fn selection_is_deterministic_and_ties_keep_enumeration_order() {
        let candidates = [
            candidate("Small", 128),
            candidate("First", 2048),
            candidate("Second", 2048),
        ];
        for _ in 0..16 {
            assert_eq!(select_device(&candidates, None, MIN_API_VERSION).unwrap(), 1);
        }
    }

    #[test]
    fn valid_override_wins_regardless_of_memory() {
        let candidates = [candidate("Big", 8192), candidate("Tiny", 64)];
        assert_eq!(select_device(&candidates, Some(1), MIN_API_VERSION).unwrap(), 1);
    }

    #[test]
    fn invalid_override_falls_back_to_heuristic() {
        let mut old = candidate("Old", 16384);
        old.api_version = vk::API_VERSION_1_1;
        let candidates = [old, candidate("Modern", 1024), candidate("Bigger", 2048)];

        assert_eq!(select_device(&candidates, Some(0), MIN_API_VERSION).unwrap(), 2);
        assert_eq!(select_device(&candidates, Some(7), MIN_API_VERSION).unwrap(), 2);
    }

    #[test]
    fn ineligible_devices_are_never_chosen() {
        let mut no_features = candidate("No features", 16384);
        no_features.meets_features = false;
        let mut no_present = candidate("Headless", 16384);
        no_present.queue_family = None;
        let candidates = [no_features, no_present, candidate("Usable", 256)];

        assert_eq!(select_device(&candidates, None, MIN_API_VERSION).unwrap(), 2);
    }

    #[test]
    fn no_eligible_device_is_an_error_naming_the_devices() {
        let mut old = candidate("Ancient GPU", 1024);
        old.api_version = vk::API_VERSION_1_0;

        let err = select_device(&[old], None, MIN_API_VERSION).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Ancient GPU"), "{message}");
        assert!(message.contains("1.3.0"), "{message}");

        assert!(select_device(&[], None, MIN_API_VERSION).is_err());
    }

    #[test]
    fn only_device_local_heaps_are_summed() {
        let mut memory = vk::PhysicalDeviceMemoryProperties::default();
        memory.memory_heap_count = 3;
        memory.memory_heaps[0] = vk::MemoryHeap {
            size: 256 * MIB,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        memory.memory_heaps[1] = vk::MemoryHeap {
            size: 16384 * MIB,
            flags: vk::MemoryHeapFlags::empty(),
        };
        memory.memory_heaps[2] = vk::MemoryHeap {
            size: 64 * MIB,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        // Beyond memory_heap_count, must be ignored
        memory.memory_heaps[3] = vk::MemoryHeap {
            size: 1024 * MIB,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };

        assert_eq!(device_local_heap_bytes(&memory), 320 * MIB);
    }

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn present_family_must_also_do_graphics() {
        let families = [
            family(vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS),
        ];
        let mut queried = Vec::new();
        let found = find_present_queue_family(&families, |index| {
            queried.push(index);
            Ok(index == 2)
        })
        .unwrap();

        assert_eq!(found, Some(2));
        assert_eq!(queried, vec![1, 2]);
    }

    #[test]
    fn failed_surface_query_leaves_device_ineligible() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        let queue_family = find_present_queue_family(&families, |_| Err(vk::Result::ERROR_SURFACE_LOST_KHR))
            .unwrap_or(None);
        assert_eq!(queue_family, None);

        // The device drops out of selection instead of aborting it
        let mut broken = candidate("Broken surface", 16384);
        broken.queue_family = queue_family;
        let candidates = [broken, candidate("Working", 512)];
        assert_eq!(select_device(&candidates, None, MIN_API_VERSION).unwrap(), 1);
    }

    #[test]
    fn versions_format_as_dotted_triples() {
        assert_eq!(format_version(vk::make_api_version(0, 1, 3, 250)), "1.3.250");
    }
}
