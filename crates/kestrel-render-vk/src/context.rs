// SPDX-License-Identifier: CEPL-1.0
//! Instance, adapter and logical device: built once, shared by `Arc`.
//!
//! Each stage lives in its own `OnceLock` so the public entry points are
//! idempotent and the context can be handed out before the later stages run.
//! Fields drop top to bottom: logical device, adapter, instance (messenger
//! first), then the loader.
use std::ffi::{c_void, CStr, CString};
use std::sync::OnceLock;

use ash::ext::debug_utils;
use ash::khr::{surface, swapchain};
use ash::{vk, Entry};
use raw_window_handle::RawDisplayHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::{VkError, VkResult};
use crate::surface::Surface;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";
const DEVICE_EXTENSIONS: [&CStr; 1] = [swapchain::NAME];

/// Queue families used for drawing and presenting. They may coincide.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    /// Minimal set of families that need a queue.
    pub fn unique(&self) -> Vec<u32> {
        if self.graphics == self.present {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }

    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }
}

/// Per-family capability bits fed to [`pick_queue_families`].
#[derive(Clone, Copy, Debug, Default)]
pub struct FamilySupport {
    pub graphics: bool,
    pub present: bool,
}

/// Prefer one family doing both; otherwise the first graphics and first present family.
pub fn pick_queue_families(families: &[FamilySupport]) -> Option<QueueFamilies> {
    if let Some(i) = families.iter().position(|f| f.graphics && f.present) {
        return Some(QueueFamilies {
            graphics: i as u32,
            present: i as u32,
        });
    }
    let graphics = families.iter().position(|f| f.graphics)?;
    let present = families.iter().position(|f| f.present)?;
    Some(QueueFamilies {
        graphics: graphics as u32,
        present: present as u32,
    })
}

/// What the scorer needs to know about one physical device.
#[derive(Clone, Copy, Debug, Default)]
pub struct AdapterReport {
    pub discrete: bool,
    pub max_image_dimension_2d: u32,
    pub geometry_shader: bool,
    pub queue_families: bool,
    pub extensions: bool,
    pub surface_adequate: bool,
}

/// 0 means ineligible.
pub fn rate_adapter(report: &AdapterReport) -> u32 {
    let eligible = report.geometry_shader
        && report.queue_families
        && report.extensions
        && report.surface_adequate;
    if !eligible {
        return 0;
    }
    let bonus = if report.discrete { 1000 } else { 0 };
    report.max_image_dimension_2d.saturating_add(bonus)
}

/// First maximal positive score in enumeration order.
pub fn pick_adapter(scores: &[u32]) -> Option<usize> {
    let mut best: Option<(usize, u32)> = None;
    for (i, &score) in scores.iter().enumerate() {
        if score == 0 {
            continue;
        }
        match best {
            Some((_, s)) if s >= score => {}
            _ => best = Some((i, score)),
        }
    }
    best.map(|(i, _)| i)
}

pub struct Adapter {
    pub physical: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub memory: vk::PhysicalDeviceMemoryProperties,
    pub families: QueueFamilies,
    pub score: u32,
}

impl Adapter {
    pub fn name(&self) -> String {
        self.properties
            .device_name_as_c_str()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "<unnamed>".to_owned())
    }
}

struct InstanceState {
    instance: ash::Instance,
    surface_loader: surface::Instance,
    debug: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl Drop for InstanceState {
    fn drop(&mut self) {
        unsafe {
            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        debug!("instance destroyed");
    }
}

struct LogicalDevice {
    device: ash::Device,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
        debug!("logical device destroyed");
    }
}

pub struct DeviceContext {
    device: OnceLock<LogicalDevice>,
    adapter: OnceLock<Adapter>,
    instance: OnceLock<InstanceState>,
    validation: bool,
    entry: Entry,
}

impl DeviceContext {
    /// Load the Vulkan library. Nothing is created until [`initialize`](Self::initialize).
    pub fn new(validation: bool) -> VkResult<Self> {
        let entry = unsafe { Entry::load()? };
        Ok(DeviceContext {
            device: OnceLock::new(),
            adapter: OnceLock::new(),
            instance: OnceLock::new(),
            validation,
            entry,
        })
    }

    /// Create the instance (plus debug messenger when validating). A second call is a no-op.
    ///
    /// `display` selects the platform surface extensions; `None` creates a headless instance.
    pub fn initialize(&self, app_name: &str, display: Option<RawDisplayHandle>) -> VkResult<()> {
        if self.instance.get().is_some() {
            debug!("device context already initialized");
            return Ok(());
        }

        if self.validation && !self.has_validation_layer()? {
            return Err(VkError::MissingLayer(
                VALIDATION_LAYER.to_string_lossy().into_owned(),
            ));
        }

        let mut extensions: Vec<*const std::ffi::c_char> = match display {
            Some(dh) => ash_window::enumerate_required_extensions(dh)?.to_vec(),
            None => Vec::new(),
        };
        if self.validation {
            extensions.push(debug_utils::NAME.as_ptr());
        }
        let layers = [VALIDATION_LAYER.as_ptr()];

        let app = CString::new(app_name).unwrap_or_default();
        let engine = c"kestrel";
        let app_info = vk::ApplicationInfo {
            s_type: vk::StructureType::APPLICATION_INFO,
            p_application_name: app.as_ptr(),
            application_version: vk::make_api_version(0, 1, 0, 0),
            p_engine_name: engine.as_ptr(),
            engine_version: vk::make_api_version(0, 1, 0, 0),
            api_version: vk::API_VERSION_1_0,
            ..Default::default()
        };

        let create_info = vk::InstanceCreateInfo {
            s_type: vk::StructureType::INSTANCE_CREATE_INFO,
            p_application_info: &app_info,
            enabled_extension_count: extensions.len() as u32,
            pp_enabled_extension_names: extensions.as_ptr(),
            enabled_layer_count: if self.validation { layers.len() as u32 } else { 0 },
            pp_enabled_layer_names: if self.validation {
                layers.as_ptr()
            } else {
                std::ptr::null()
            },
            ..Default::default()
        };

        let instance = unsafe { self.entry.create_instance(&create_info, None)? };
        let surface_loader = surface::Instance::new(&self.entry, &instance);
        let mut state = InstanceState {
            instance,
            surface_loader,
            debug: None,
        };

        if self.validation {
            // On failure `state` drops here and takes the instance with it.
            state.debug = Some(create_debug_messenger(&self.entry, &state.instance)?);
        }

        info!(
            app = app_name,
            validation = self.validation,
            extensions = extensions.len(),
            "vulkan instance created"
        );
        // A racing initializer loses; its state drops and cleans up.
        let _ = self.instance.set(state);
        Ok(())
    }

    fn has_validation_layer(&self) -> VkResult<bool> {
        let layers = unsafe { self.entry.enumerate_instance_layer_properties()? };
        Ok(layers.iter().any(|l| {
            // SAFETY: layer_name is a NUL-terminated fixed array filled by the loader.
            unsafe { CStr::from_ptr(l.layer_name.as_ptr()) == VALIDATION_LAYER }
        }))
    }

    /// Score every adapter against `surface` and keep the best. Idempotent.
    pub fn select_adapter(&self, surface: &Surface) -> VkResult<&Adapter> {
        if let Some(adapter) = self.adapter.get() {
            return Ok(adapter);
        }
        let state = self.instance_state()?;
        let instance = &state.instance;

        let physicals = unsafe { instance.enumerate_physical_devices()? };
        let mut candidates = Vec::with_capacity(physicals.len());
        for phys in physicals {
            let properties = unsafe { instance.get_physical_device_properties(phys) };
            let features = unsafe { instance.get_physical_device_features(phys) };
            let families = self.probe_queue_families(phys, surface)?;
            let extensions = device_supports_extensions(instance, phys)?;
            let surface_adequate = extensions && surface.support(phys)?.is_adequate();

            let report = AdapterReport {
                discrete: properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU,
                max_image_dimension_2d: properties.limits.max_image_dimension2_d,
                geometry_shader: features.geometry_shader == vk::TRUE,
                queue_families: families.is_some(),
                extensions,
                surface_adequate,
            };
            let score = rate_adapter(&report);
            debug!(?phys, score, ?report, "adapter candidate");
            candidates.push((phys, properties, families, score));
        }

        let scores: Vec<u32> = candidates.iter().map(|c| c.3).collect();
        let idx = pick_adapter(&scores).ok_or(VkError::NoSuitableAdapter)?;
        let (physical, properties, families, score) = candidates.swap_remove(idx);
        let families = families.ok_or(VkError::NoSuitableAdapter)?;
        let memory = unsafe { instance.get_physical_device_memory_properties(physical) };

        let adapter = Adapter {
            physical,
            properties,
            memory,
            families,
            score,
        };
        info!(
            name = %adapter.name(),
            score,
            graphics = families.graphics,
            present = families.present,
            "adapter selected"
        );
        let _ = self.adapter.set(adapter);
        self.adapter()
    }

    fn probe_queue_families(
        &self,
        phys: vk::PhysicalDevice,
        surface: &Surface,
    ) -> VkResult<Option<QueueFamilies>> {
        let state = self.instance_state()?;
        let props = unsafe {
            state
                .instance
                .get_physical_device_queue_family_properties(phys)
        };
        let mut support = Vec::with_capacity(props.len());
        for (i, family) in props.iter().enumerate() {
            let present = unsafe {
                state.surface_loader.get_physical_device_surface_support(
                    phys,
                    i as u32,
                    surface.handle(),
                )?
            };
            support.push(FamilySupport {
                graphics: family.queue_flags.contains(vk::QueueFlags::GRAPHICS),
                present,
            });
        }
        Ok(pick_queue_families(&support))
    }

    /// One queue per unique family, swapchain extension on. Selects the adapter if needed.
    pub fn create_logical_device(&self, surface: &Surface) -> VkResult<()> {
        if self.device.get().is_some() {
            return Ok(());
        }
        let adapter = self.select_adapter(surface)?;
        let instance = &self.instance_state()?.instance;

        let priorities = [1.0_f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = adapter
            .families
            .unique()
            .into_iter()
            .map(|family| vk::DeviceQueueCreateInfo {
                s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
                queue_family_index: family,
                queue_count: 1,
                p_queue_priorities: priorities.as_ptr(),
                ..Default::default()
            })
            .collect();

        let features = vk::PhysicalDeviceFeatures::default();
        let extensions: Vec<*const std::ffi::c_char> =
            DEVICE_EXTENSIONS.iter().map(|e| e.as_ptr()).collect();
        let layers = [VALIDATION_LAYER.as_ptr()];

        // Device layers are ignored by current loaders but older ones still read them.
        #[allow(deprecated)]
        let create_info = vk::DeviceCreateInfo {
            s_type: vk::StructureType::DEVICE_CREATE_INFO,
            queue_create_info_count: queue_infos.len() as u32,
            p_queue_create_infos: queue_infos.as_ptr(),
            p_enabled_features: &features,
            enabled_extension_count: extensions.len() as u32,
            pp_enabled_extension_names: extensions.as_ptr(),
            enabled_layer_count: if self.validation { 1 } else { 0 },
            pp_enabled_layer_names: if self.validation {
                layers.as_ptr()
            } else {
                std::ptr::null()
            },
            ..Default::default()
        };

        let device = unsafe { instance.create_device(adapter.physical, &create_info, None)? };
        let graphics_queue = unsafe { device.get_device_queue(adapter.families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(adapter.families.present, 0) };
        info!(
            queues = queue_infos.len(),
            shared = adapter.families.is_shared(),
            "logical device created"
        );
        let _ = self.device.set(LogicalDevice {
            device,
            graphics_queue,
            present_queue,
        });
        Ok(())
    }

    // --- accessors -----------------------------------------------------------

    fn instance_state(&self) -> VkResult<&InstanceState> {
        self.instance
            .get()
            .ok_or(VkError::NotInitialized("vulkan instance"))
    }

    fn logical(&self) -> VkResult<&LogicalDevice> {
        self.device
            .get()
            .ok_or(VkError::NotInitialized("logical device"))
    }

    pub fn is_initialized(&self) -> bool {
        self.instance.get().is_some()
    }

    pub fn validation_enabled(&self) -> bool {
        self.validation
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn instance(&self) -> VkResult<&ash::Instance> {
        Ok(&self.instance_state()?.instance)
    }

    pub fn surface_loader(&self) -> VkResult<&surface::Instance> {
        Ok(&self.instance_state()?.surface_loader)
    }

    pub fn adapter(&self) -> VkResult<&Adapter> {
        self.adapter
            .get()
            .ok_or(VkError::NotInitialized("physical adapter"))
    }

    pub fn device(&self) -> VkResult<&ash::Device> {
        Ok(&self.logical()?.device)
    }

    pub fn graphics_queue(&self) -> VkResult<vk::Queue> {
        Ok(self.logical()?.graphics_queue)
    }

    pub fn present_queue(&self) -> VkResult<vk::Queue> {
        Ok(self.logical()?.present_queue)
    }

    pub fn queue_families(&self) -> VkResult<QueueFamilies> {
        Ok(self.adapter()?.families)
    }

    pub fn limits(&self) -> VkResult<&vk::PhysicalDeviceLimits> {
        Ok(&self.adapter()?.properties.limits)
    }

    pub fn memory_properties(&self) -> VkResult<&vk::PhysicalDeviceMemoryProperties> {
        Ok(&self.adapter()?.memory)
    }

    pub fn format_properties(&self, format: vk::Format) -> VkResult<vk::FormatProperties> {
        let instance = self.instance()?;
        let phys = self.adapter()?.physical;
        Ok(unsafe { instance.get_physical_device_format_properties(phys, format) })
    }

    pub fn wait_idle(&self) -> VkResult<()> {
        unsafe { self.device()?.device_wait_idle() }.map_err(VkError::classify)
    }
}

fn device_supports_extensions(instance: &ash::Instance, phys: vk::PhysicalDevice) -> VkResult<bool> {
    let available = unsafe { instance.enumerate_device_extension_properties(phys)? };
    Ok(DEVICE_EXTENSIONS.iter().all(|wanted| {
        available.iter().any(|e| {
            // SAFETY: extension_name is NUL-terminated by the driver.
            unsafe { CStr::from_ptr(e.extension_name.as_ptr()) == *wanted }
        })
    }))
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() {
        return vk::FALSE;
    }
    // SAFETY: the loader hands us a valid callback struct for the duration of the call.
    let message = unsafe {
        let p = (*data).p_message;
        if p.is_null() {
            return vk::FALSE;
        }
        CStr::from_ptr(p).to_string_lossy()
    };

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "vulkan", "{message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!(target: "vulkan", "{message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        debug!(target: "vulkan", "{message}");
    } else {
        trace!(target: "vulkan", "{message}");
    }
    vk::FALSE
}

fn create_debug_messenger(
    entry: &Entry,
    instance: &ash::Instance,
) -> VkResult<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
    let loader = debug_utils::Instance::new(entry, instance);
    let ci = vk::DebugUtilsMessengerCreateInfoEXT {
        s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
            | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    };
    let messenger = unsafe { loader.create_debug_utils_messenger(&ci, None)? };
    Ok((loader, messenger))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eligible(discrete: bool, dim: u32) -> AdapterReport {
        AdapterReport {
            discrete,
            max_image_dimension_2d: dim,
            geometry_shader: true,
            queue_families: true,
            extensions: true,
            surface_adequate: true,
        }
    }

    #[test]
    fn discrete_adapter_gets_bonus() {
        assert_eq!(rate_adapter(&eligible(true, 16384)), 17384);
        assert_eq!(rate_adapter(&eligible(false, 16384)), 16384);
    }

    #[test]
    fn any_missing_requirement_zeroes_the_score() {
        let base = eligible(true, 8192);
        let broken = [
            AdapterReport { geometry_shader: false, ..base },
            AdapterReport { queue_families: false, ..base },
            AdapterReport { extensions: false, ..base },
            AdapterReport { surface_adequate: false, ..base },
        ];
        for report in broken {
            assert_eq!(rate_adapter(&report), 0, "{report:?}");
        }
    }

    #[test]
    fn first_maximal_adapter_wins_ties() {
        assert_eq!(pick_adapter(&[100, 300, 300, 200]), Some(1));
        assert_eq!(pick_adapter(&[0, 5]), Some(1));
    }

    #[test]
    fn no_positive_score_means_no_adapter() {
        assert_eq!(pick_adapter(&[0, 0]), None);
        assert_eq!(pick_adapter(&[]), None);
    }

    #[test]
    fn shared_family_is_preferred() {
        let families = [
            FamilySupport { graphics: true, present: false },
            FamilySupport { graphics: true, present: true },
        ];
        let picked = pick_queue_families(&families).unwrap();
        assert_eq!(picked, QueueFamilies { graphics: 1, present: 1 });
        assert_eq!(picked.unique(), vec![1]);
        assert!(picked.is_shared());
    }

    #[test]
    fn split_families_yield_two_queues() {
        let families = [
            FamilySupport { graphics: true, present: false },
            FamilySupport { graphics: false, present: true },
        ];
        let picked = pick_queue_families(&families).unwrap();
        assert_eq!(picked.unique(), vec![0, 1]);
        assert!(!picked.is_shared());
    }

    #[test]
    fn missing_present_family_is_incomplete() {
        let families = [FamilySupport { graphics: true, present: false }];
        assert_eq!(pick_queue_families(&families), None);
    }
}
