// =============================================================================
// SCENE VIEWER - Reflective sphere, textured cube, skybox, live monitor
// =============================================================================
//
// Drives the vk_scene_components library from a winit window.
//
// FRAME FLOW:
// 1. ECS schedule (spin, resolve texture requests, evict, build draw list)
// 2. Bind materials for entities whose textures were (re)resolved
// 3. Wait for this slot's fence, acquire swapchain image
// 4. Record: capture pass (offscreen, sampled later) then main pass
// 5. Submit, present
//
// KEYS:
//   Tab            switch between the two environment scenes
//   fullscreen_key toggle fullscreen (config, default F11)
//   quit_key       exit (config, default Escape)
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use bevy_ecs::prelude::*;
use glam::{Quat, Vec3};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Fullscreen, Window, WindowAttributes},
};

use vk_scene_components::backend::pipeline::{
    create_framebuffers, create_render_pass, RenderPassDesc,
};
use vk_scene_components::backend::sync::{drive_frame, FrameBackend, FrameStatus, FramesInFlight};
use vk_scene_components::backend::{ImageLayoutState, Swapchain};
use vk_scene_components::material::{
    CubemapReflectionMaterial, DrawMaterial, DrawPush, Material, MaterialKind,
    ReflectionBindings, ReflectionUniform, RenderPassId, RenderPassMask, SceneId,
    SkyboxBindings, SkyboxMaterial, SkyboxUniform, TexturedBindings, TexturedMaterial,
    TexturedUniform,
};
use vk_scene_components::mesh::{self, GpuMesh, MeshId};
use vk_scene_components::scene::{
    init_render_resources, invalidate_textures, register_render_systems, texture_key,
    ActiveScene, Camera, DrawList, FrameTime, MaterialRef, MeshRenderer, RenderPasses,
    ResolvedTextures, SceneEnvironment, Spin, SurfaceAspect, TextureHandle, TextureProviderRes,
    TextureRequest, TextureSourceDesc, Transform,
};
use vk_scene_components::texture::{
    select_depth_format, Procedural, Texture, TextureCache, TextureWatcher,
};
use vk_scene_components::{Config, VulkanDevice};

// Scene 0 uses the configured cubemap, scene 1 a generated one. Tab swaps them.
const ENVIRONMENT_SCENES: [SceneId; 2] = [SceneId(0), SceneId(1)];
// Bindings of the monitor, which shows the capture target
const MONITOR_SCENE: SceneId = SceneId(2);

const CUBE: MeshId = MeshId(0);
const SPHERE: MeshId = MeshId(1);

const CAPTURE_NAME: &str = "capture";
const CAPTURE_SIZE: u32 = 512;
const CAPTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting scene viewer");
    log::info!("Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);
    log::info!("Asset root: {:?}", config.textures.asset_root);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Initialize logging; with `debug.log_to_file` records go to the log file
/// instead of stderr
fn init_logging(config: &Config) {
    use env_logger::{Builder, Target};
    use log::LevelFilter;

    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    // RUST_LOG still overrides the default level
    builder.parse_default_env();

    let mut file_error = None;
    if config.debug.log_to_file {
        match open_log_file(Path::new(&config.debug.log_file)) {
            Ok(file) => {
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => file_error = Some(e),
        }
    }
    builder.init();

    if let Some(e) = file_error {
        log::warn!("Cannot log to {}, using stderr: {}", config.debug.log_file, e);
    }
}

/// Truncate `path` and write the log header
fn open_log_file(path: &Path) -> std::io::Result<File> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    writeln!(file, "=== Scene Viewer Log ===")?;
    writeln!(file, "Started: {:?}", std::time::SystemTime::now())?;
    writeln!(file)?;
    Ok(file)
}

/// Key names as written in config.toml
fn parse_key(name: &str) -> Option<KeyCode> {
    let key = match name.to_lowercase().as_str() {
        "escape" | "esc" => KeyCode::Escape,
        "f1" => KeyCode::F1,
        "f2" => KeyCode::F2,
        "f3" => KeyCode::F3,
        "f4" => KeyCode::F4,
        "f5" => KeyCode::F5,
        "f6" => KeyCode::F6,
        "f7" => KeyCode::F7,
        "f8" => KeyCode::F8,
        "f9" => KeyCode::F9,
        "f10" => KeyCode::F10,
        "f11" => KeyCode::F11,
        "f12" => KeyCode::F12,
        "enter" | "return" => KeyCode::Enter,
        "space" => KeyCode::Space,
        "q" => KeyCode::KeyQ,
        "f" => KeyCode::KeyF,
        _ => return None,
    };
    Some(key)
}

fn key_or(name: &str, default: KeyCode) -> KeyCode {
    parse_key(name).unwrap_or_else(|| {
        log::warn!("Unknown key '{}', using {:?}", name, default);
        default
    })
}

// =============================================================================
// WORLD SETUP
// =============================================================================

fn populate_world(world: &mut World, config: &Config) {
    let both = RenderPasses(
        RenderPassMask::only(RenderPassId::MAIN).with(RenderPassId::REFLECTION_CAPTURE),
    );

    // Environments
    world.spawn((
        SceneEnvironment(ENVIRONMENT_SCENES[0]),
        TextureRequest::new(TextureSourceDesc::Cubemap(config.scene.environment.clone())),
    ));
    world.spawn((
        SceneEnvironment(ENVIRONMENT_SCENES[1]),
        TextureRequest::new(TextureSourceDesc::Procedural(Procedural::SolidCubemap {
            rgba: [40, 70, 120, 255],
            size: 16,
        })),
    ));

    world.spawn((
        Transform::default(),
        MeshRenderer { mesh: CUBE },
        MaterialRef::of::<SkyboxMaterial>(),
        both,
    ));

    world.spawn((
        Transform::default().with_scale(Vec3::splat(1.6)),
        MeshRenderer { mesh: SPHERE },
        MaterialRef::of::<CubemapReflectionMaterial>(),
        both,
    ));

    world.spawn((
        Transform::from_position(Vec3::new(2.2, 0.0, 0.0)),
        MeshRenderer { mesh: CUBE },
        MaterialRef::of::<TexturedMaterial>(),
        TextureRequest::new(TextureSourceDesc::File(config.scene.albedo.clone())),
        Spin {
            axis: Vec3::new(0.3, 1.0, 0.0),
            radians_per_second: 0.8,
        },
    ));

    // Flat box showing what the capture camera sees
    world.spawn((
        Transform::from_position(Vec3::new(-2.4, 0.6, -0.5))
            .with_rotation(Quat::from_rotation_y(0.5))
            .with_scale(Vec3::new(1.6, 1.6, 0.05)),
        MeshRenderer { mesh: CUBE },
        MaterialRef::of::<TexturedMaterial>().pinned(MONITOR_SCENE),
        TextureRequest::new(TextureSourceDesc::Named(CAPTURE_NAME.to_string())),
    ));

    world.spawn((
        Camera::default(),
        Transform::from_position(Vec3::new(0.0, 1.2, 5.5)).looking_at(Vec3::ZERO, Vec3::Y),
    ));
    world.spawn((
        Camera {
            pass: RenderPassId::REFLECTION_CAPTURE,
            aspect: Some(1.0),
            fov_y: 50f32.to_radians(),
            ..Default::default()
        },
        Transform::from_position(Vec3::new(3.5, 2.5, 3.5)).looking_at(Vec3::ZERO, Vec3::Y),
    ));
}

// =============================================================================
// CAPTURE TARGET
// =============================================================================

/// Offscreen pass whose color target the monitor samples
struct CaptureTarget {
    color: Arc<Texture>,
    depth: Texture,
    render_pass: vk::RenderPass,
    framebuffer: vk::Framebuffer,
    extent: vk::Extent2D,
}

impl CaptureTarget {
    /// The color target is registered in `cache` under `CAPTURE_NAME`
    fn new(
        device: &Arc<VulkanDevice>,
        cache: &mut TextureCache,
        depth_format: vk::Format,
    ) -> Result<Self> {
        let color = Texture::render_target(device, CAPTURE_SIZE, CAPTURE_SIZE, CAPTURE_FORMAT, true)
            .context("Failed to create capture target")?;
        let color = cache.insert_named(CAPTURE_NAME, color);
        let depth = Texture::depth_target(device, CAPTURE_SIZE, CAPTURE_SIZE, depth_format)?;

        let render_pass = create_render_pass(
            device,
            &RenderPassDesc::offscreen(CAPTURE_FORMAT, Some(depth_format)),
        )?;
        let extent = vk::Extent2D {
            width: CAPTURE_SIZE,
            height: CAPTURE_SIZE,
        };
        let framebuffer = create_framebuffers(
            device,
            &[color.view()],
            Some(depth.view()),
            render_pass,
            extent,
        )?
        .into_iter()
        .next()
        .context("No capture framebuffer")?;

        Ok(Self {
            color,
            depth,
            render_pass,
            framebuffer,
            extent,
        })
    }

    fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_framebuffer(self.framebuffer, None);
            device.destroy_render_pass(self.render_pass, None);
        }
    }
}

// =============================================================================
// VIEWER STATE
// =============================================================================

/// Everything that exists once the window does.
///
/// Vulkan handles without an owning wrapper are destroyed in `Drop`;
/// wrapped ones (textures, materials, meshes) drop afterwards with
/// their fields. The device goes last, with its final `Arc`.
struct Viewer {
    world: World,
    schedule: Schedule,
    watcher: Option<TextureWatcher>,

    reflection: Material<CubemapReflectionMaterial>,
    textured: Material<TexturedMaterial>,
    skybox: Material<SkyboxMaterial>,
    meshes: Vec<GpuMesh>,

    capture: CaptureTarget,
    depth_format: vk::Format,
    depth: Option<Texture>,
    main_pass: vk::RenderPass,
    main_pass_format: Option<vk::Format>,
    framebuffers: Vec<vk::Framebuffer>,
    swapchain: Option<Swapchain>,

    command_pool: vk::CommandPool,
    /// One per frame in flight, re-recorded every frame
    command_buffers: Vec<vk::CommandBuffer>,
    frames: FramesInFlight,

    surface: vk::SurfaceKHR,
    surface_loader: ash::khr::surface::Instance,

    present_mode: vk::PresentModeKHR,
    clear_color: [f32; 4],
    reflectivity: f32,

    device: Arc<VulkanDevice>,
}

impl Viewer {
    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    fn new(config: &Config, window: &Window) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        // ─────────────────────────────────────────────────────────────────────
        // Device + surface
        // ─────────────────────────────────────────────────────────────────────
        let display_handle = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let window_handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();

        let surface_extensions = ash_window::enumerate_required_extensions(display_handle)
            .context("Unsupported display for Vulkan surfaces")?;
        let enable_validation = cfg!(debug_assertions) && config.debug.validation_layers;
        let device = VulkanDevice::new(&config.window.title, enable_validation, surface_extensions)?;

        let surface_loader = ash::khr::surface::Instance::new(&device.entry, &device.instance);
        let surface = unsafe {
            ash_window::create_surface(
                &device.entry,
                &device.instance,
                display_handle,
                window_handle,
                None,
            )
        }
        .context("Failed to create window surface")?;

        let surface_support = unsafe {
            surface_loader.get_physical_device_surface_support(
                device.physical_device,
                device.graphics_queue_family,
                surface,
            )
        };
        if !matches!(surface_support, Ok(true)) {
            unsafe { surface_loader.destroy_surface(surface, None) };
            anyhow::bail!("GPU doesn't support presenting to this surface");
        }

        // ─────────────────────────────────────────────────────────────────────
        // Commands + sync (independent of the swapchain)
        // ─────────────────────────────────────────────────────────────────────
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(device.graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None)? };

        let max_frames = config.graphics.max_frames_in_flight.max(1);
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(max_frames as u32);
        let command_buffers = unsafe { device.device.allocate_command_buffers(&alloc_info)? };
        let frames = FramesInFlight::new(&device, max_frames)?;

        // ─────────────────────────────────────────────────────────────────────
        // Scene resources
        // ─────────────────────────────────────────────────────────────────────
        let depth_format = select_depth_format(&device).context("No supported depth format")?;
        let mut cache = TextureCache::new(device.clone(), &config.textures);
        let capture = CaptureTarget::new(&device, &mut cache, depth_format)?;

        let shader_dir = &config.scene.shader_dir;
        let reflection = Material::new(&device, shader_dir)?;
        let textured = Material::new(&device, shader_dir)?;
        let skybox = Material::new(&device, shader_dir)?;

        let meshes = vec![
            GpuMesh::upload(&device, &mesh::cube(), "cube")?,
            GpuMesh::upload(&device, &mesh::uv_sphere(48, 24), "sphere")?,
        ];

        let watcher = if config.textures.hot_reload {
            match TextureWatcher::new(&config.textures.asset_root) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    log::warn!("Texture hot reload disabled: {:#}", e);
                    None
                }
            }
        } else {
            None
        };

        let mut world = World::new();
        init_render_resources(&mut world, cache);
        world.insert_resource(ActiveScene(ENVIRONMENT_SCENES[0]));
        populate_world(&mut world, config);

        let mut schedule = Schedule::default();
        register_render_systems::<TextureCache>(&mut schedule);

        let mut viewer = Self {
            world,
            schedule,
            watcher,
            reflection,
            textured,
            skybox,
            meshes,
            capture,
            depth_format,
            depth: None,
            main_pass: vk::RenderPass::null(),
            main_pass_format: None,
            framebuffers: Vec::new(),
            swapchain: None,
            command_pool,
            command_buffers,
            frames,
            surface,
            surface_loader,
            present_mode: config.get_present_mode(),
            clear_color: config.graphics.clear_color,
            reflectivity: config.scene.reflectivity,
            device,
        };

        let size = window.inner_size();
        viewer.create_swapchain_resources(size.width, size.height)?;

        log::info!("Vulkan initialized successfully!");
        Ok(viewer)
    }

    /// Create swapchain, depth buffer and framebuffers for the window size.
    /// Called again on every resize.
    fn create_swapchain_resources(&mut self, width: u32, height: u32) -> Result<()> {
        let device = self.device.clone();

        for framebuffer in self.framebuffers.drain(..) {
            unsafe { device.device.destroy_framebuffer(framebuffer, None) };
        }
        self.depth = None;
        // The surface can only have one swapchain at a time
        self.swapchain = None;

        let swapchain = Swapchain::new(
            device.clone(),
            self.surface,
            &self.surface_loader,
            width,
            height,
            self.present_mode,
        )?;

        let extent = swapchain.extent;
        let depth = Texture::depth_target(&device, extent.width, extent.height, self.depth_format)?;

        // The pass only depends on formats; rebuild it (and the pipelines
        // built against it) when the surface format changes
        if self.main_pass_format != Some(swapchain.format) {
            if self.main_pass_format.is_some() {
                unsafe { device.device.destroy_render_pass(self.main_pass, None) };
                self.reflection.release_pass(RenderPassId::MAIN);
                self.textured.release_pass(RenderPassId::MAIN);
                self.skybox.release_pass(RenderPassId::MAIN);
            }
            self.main_pass = create_render_pass(
                &device,
                &RenderPassDesc::present(swapchain.format, self.depth_format),
            )?;
            self.main_pass_format = Some(swapchain.format);
        }

        self.framebuffers = create_framebuffers(
            &device,
            &swapchain.image_views,
            Some(depth.view()),
            self.main_pass,
            extent,
        )?;

        log::info!(
            "Created {} framebuffers ({}x{})",
            self.framebuffers.len(),
            extent.width,
            extent.height
        );

        self.depth = Some(depth);
        self.swapchain = Some(swapchain);
        Ok(())
    }

    fn swapchain_extent(&self) -> Option<vk::Extent2D> {
        self.swapchain.as_ref().map(|swapchain| swapchain.extent)
    }

    // =========================================================================
    // SCENE UPDATE
    // =========================================================================

    /// Run the ECS schedule and rebind whatever it resolved
    fn update(&mut self, delta_seconds: f32) -> Result<()> {
        self.poll_hot_reload()?;

        if let Some(extent) = self.swapchain_extent() {
            let aspect = extent.width as f32 / extent.height.max(1) as f32;
            self.world.insert_resource(SurfaceAspect(aspect));
        }
        self.world.insert_resource(FrameTime { delta_seconds });
        self.schedule.run(&mut self.world);

        self.bind_resolved()
    }

    fn toggle_environment(&mut self) {
        let mut active = self.world.resource_mut::<ActiveScene>();
        active.0 = if active.0 == ENVIRONMENT_SCENES[0] {
            ENVIRONMENT_SCENES[1]
        } else {
            ENVIRONMENT_SCENES[0]
        };
        log::info!("Active environment: {:?}", active.0);
    }

    /// Write descriptor sets for entities whose texture handle is new
    fn bind_resolved(&mut self) -> Result<()> {
        let resolved = self.world.resource_mut::<ResolvedTextures>().drain();
        if resolved.is_empty() {
            return Ok(());
        }

        // Sets may be rewritten while earlier frames still read them
        self.device.wait_idle()?;

        for entity in resolved {
            let Some(handle) = self.world.get::<TextureHandle<Texture>>(entity).cloned() else {
                continue;
            };

            if let Some(&SceneEnvironment(scene)) = self.world.get::<SceneEnvironment>(entity) {
                let environment = handle.texture;
                let reflection = self.reflection.bind_scene(
                    scene,
                    &ReflectionBindings {
                        environment: environment.clone(),
                    },
                    &ReflectionUniform::new([1.0; 4], self.reflectivity),
                );
                let skybox = self.skybox.bind_scene(
                    scene,
                    &SkyboxBindings { environment },
                    &SkyboxUniform::default(),
                );
                if let Err(e) = reflection.and(skybox) {
                    log::warn!("Environment for {:?} not bound: {:#}", scene, e);
                }
                continue;
            }

            let Some(&material) = self.world.get::<MaterialRef>(entity) else {
                continue;
            };
            if material.kind != TexturedMaterial::kind_id() {
                log::warn!("{:?} has a texture but {} takes none", entity, material.kind.0);
                continue;
            }
            // Unpinned entities follow the active scene, so bind every one
            let scenes = match material.scene {
                Some(scene) => vec![scene],
                None => ENVIRONMENT_SCENES.to_vec(),
            };
            let bindings = TexturedBindings {
                albedo: handle.texture,
            };
            for scene in scenes {
                if let Err(e) = self.textured.bind_scene(scene, &bindings, &TexturedUniform::default()) {
                    log::warn!("Albedo of {:?} not bound for {:?}: {:#}", entity, scene, e);
                }
            }
        }
        Ok(())
    }

    /// Reload changed files and send the affected handles back through
    /// texture resolution
    fn poll_hot_reload(&mut self) -> Result<()> {
        let Some(watcher) = &self.watcher else {
            return Ok(());
        };
        let changed = watcher.drain_changed();
        if changed.is_empty() {
            return Ok(());
        }

        // Old textures are replaced in the cache; nothing in flight may use them
        self.device.wait_idle()?;

        let Some(provider) = self.world.remove_resource::<TextureProviderRes<TextureCache>>() else {
            return Ok(());
        };
        let mut cache = provider.0;
        let mut replaced = Vec::new();
        for path in &changed {
            replaced.extend(cache.reload(path));
        }

        let invalidated = invalidate_textures::<Texture, _>(&mut self.world, |source| {
            replaced.contains(&texture_key(&cache, source))
        });
        self.world.insert_resource(TextureProviderRes(cache));

        if invalidated > 0 {
            log::info!("{} file(s) changed, {} texture handle(s) invalidated", changed.len(), invalidated);
        }
        Ok(())
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    /// Render a single frame on the current slot; see `drive_frame` for
    /// the order of the GPU calls.
    ///
    /// FRAME TIMELINE:
    /// ┌──────────────────────────────────────────────────────────────────────┐
    /// │  wait_fence ─> acquire ─> record ─> reset ─> submit ─> present      │
    /// └──────────────────────────────────────────────────────────────────────┘
    fn render_frame(&mut self) -> Result<FrameStatus> {
        let sync = self.frames.current();
        let (image_available, render_finished, fence) =
            (sync.image_available, sync.render_finished, sync.in_flight_fence);
        let cmd = self.command_buffers[self.frames.current_index()];

        let mut frame = ViewerFrame {
            viewer: self,
            cmd,
            image_available,
            render_finished,
            fence,
            extent: vk::Extent2D::default(),
        };
        let status = drive_frame(&mut frame);
        self.frames.advance();
        status
    }

    fn record_commands(&mut self, cmd: vk::CommandBuffer, image_index: u32, extent: vk::Extent2D) -> Result<()> {
        let device = self.device.clone();
        unsafe {
            device
                .device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.device.begin_command_buffer(cmd, &begin_info)?;
        }

        // The monitor samples this, so it goes first
        let capture = PassTarget {
            pass: RenderPassId::REFLECTION_CAPTURE,
            render_pass: self.capture.render_pass,
            framebuffer: self.capture.framebuffer,
            extent: self.capture.extent,
        };
        self.record_pass(cmd, &capture)?;
        // The render pass leaves it in SHADER_READ_ONLY
        self.capture.color.assume_layout(ImageLayoutState::ShaderReadOnly);

        let framebuffer = *self
            .framebuffers
            .get(image_index as usize)
            .context("No framebuffer for swapchain image")?;
        let main = PassTarget {
            pass: RenderPassId::MAIN,
            render_pass: self.main_pass,
            framebuffer,
            extent,
        };
        self.record_pass(cmd, &main)?;

        unsafe { device.device.end_command_buffer(cmd)? };
        Ok(())
    }

    /// Begin `target`, draw its slice of the draw list, end it
    fn record_pass(&mut self, cmd: vk::CommandBuffer, target: &PassTarget) -> Result<()> {
        let device = &self.device.device;
        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];
        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: target.extent,
        };
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(target.render_pass)
            .framebuffer(target.framebuffer)
            .render_area(render_area)
            .clear_values(&clear_values);
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: target.extent.width as f32,
            height: target.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };

        unsafe {
            device.cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE);
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[render_area]);
        }

        let draw_list = self.world.resource::<DrawList>();
        let result = match draw_list.views.get(&target.pass) {
            Some(view) => {
                let mut materials: [&mut dyn DrawMaterial; 3] =
                    [&mut self.reflection, &mut self.textured, &mut self.skybox];
                let mut drawn = 0;
                let mut result = Ok(());
                for item in draw_list.pass_items(target.pass) {
                    let Some(mesh) = self.meshes.get(item.mesh.0 as usize) else {
                        log::warn!("{:?} uses unknown {:?}", item.entity, item.mesh);
                        continue;
                    };
                    let Some(material) = materials
                        .iter_mut()
                        .find(|material| material.kind_id() == item.material)
                    else {
                        log::warn!("{:?} uses unknown material {}", item.entity, item.material.0);
                        continue;
                    };
                    // The skybox stays centered on the camera
                    let view_proj = if item.material == SkyboxMaterial::kind_id() {
                        view.sky_view_proj
                    } else {
                        view.view_proj
                    };
                    let push = DrawPush::new(view_proj, item.model, view.position);
                    match material.record_draw(cmd, target.pass, target.render_pass, item.scene, mesh, &push) {
                        Ok(true) => drawn += 1,
                        Ok(false) => {}
                        Err(e) => {
                            result = Err(e);
                            break;
                        }
                    }
                }
                log::trace!("{:?}: {} draws", target.pass, drawn);
                result
            }
            None => Ok(()),
        };

        // The pass is always closed so the command buffer stays valid
        unsafe { device.cmd_end_render_pass(cmd) };
        result
    }
}

/// Where one pass of the draw list is recorded to
struct PassTarget {
    pass: RenderPassId,
    render_pass: vk::RenderPass,
    framebuffer: vk::Framebuffer,
    extent: vk::Extent2D,
}

/// `Viewer` bound to one frame-in-flight slot
struct ViewerFrame<'a> {
    viewer: &'a mut Viewer,
    cmd: vk::CommandBuffer,
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
    fence: vk::Fence,
    /// Extent of the acquired image
    extent: vk::Extent2D,
}

impl ViewerFrame<'_> {
    fn swapchain(&self) -> Result<&Swapchain> {
        self.viewer.swapchain.as_ref().context("Swapchain not initialized")
    }
}

impl FrameBackend for ViewerFrame<'_> {
    fn wait_fence(&mut self) -> Result<()> {
        unsafe {
            self.viewer
                .device
                .device
                .wait_for_fences(&[self.fence], true, u64::MAX)?;
        }
        Ok(())
    }

    fn acquire(&mut self) -> Result<Option<(u32, bool)>> {
        let swapchain = self.swapchain()?;
        let acquired = swapchain.acquire_next_image(u64::MAX, self.image_available)?;
        let extent = swapchain.extent;
        self.extent = extent;
        Ok(acquired)
    }

    fn record(&mut self, image_index: u32) -> Result<()> {
        self.viewer.record_commands(self.cmd, image_index, self.extent)
    }

    fn reset_fence(&mut self) -> Result<()> {
        unsafe { self.viewer.device.device.reset_fences(&[self.fence])? };
        Ok(())
    }

    fn submit(&mut self, with_commands: bool) -> Result<()> {
        let wait_semaphores = [self.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [self.render_finished];
        let command_buffers = [self.cmd];

        let mut submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages);
        if with_commands {
            submit_info = submit_info
                .command_buffers(&command_buffers)
                .signal_semaphores(&signal_semaphores);
        }

        let device = &self.viewer.device;
        unsafe {
            device
                .device
                .queue_submit(device.graphics_queue, &[submit_info], self.fence)?;
        }
        Ok(())
    }

    fn present(&mut self, image_index: u32) -> Result<bool> {
        let queue = self.viewer.device.graphics_queue;
        self.swapchain()?
            .present(queue, image_index, &[self.render_finished])
    }
}

impl Drop for Viewer {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        // Wait for GPU to finish before destroying anything
        let _ = self.device.wait_idle();

        let device = &self.device.device;
        unsafe {
            // Destroy in reverse order of creation
            for &framebuffer in &self.framebuffers {
                device.destroy_framebuffer(framebuffer, None);
            }
            if self.main_pass_format.is_some() {
                device.destroy_render_pass(self.main_pass, None);
            }
            self.capture.destroy(device);

            self.frames.destroy(device);
            // Also frees the command buffers
            device.destroy_command_pool(self.command_pool, None);
        }

        // Swapchain before its surface
        self.swapchain = None;
        unsafe { self.surface_loader.destroy_surface(self.surface, None) };

        // Textures, materials and meshes drop with the fields; the device
        // itself goes with the last Arc
    }
}

// =============================================================================
// APPLICATION
// =============================================================================

struct App {
    config: Config,
    // Declared before the window so the surface goes first
    viewer: Option<Viewer>,
    window: Option<Arc<Window>>,
    is_fullscreen: bool,

    fullscreen_key: KeyCode,
    quit_key: KeyCode,

    /// Set when the window is resized or the swapchain went stale
    needs_resize: bool,
    /// Window has zero size; skip rendering
    is_minimized: bool,

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let fullscreen_key = key_or(&config.controls.fullscreen_key, KeyCode::F11);
        let quit_key = key_or(&config.controls.quit_key, KeyCode::Escape);
        let now = Instant::now();
        Self {
            config,
            viewer: None,
            window: None,
            is_fullscreen,
            fullscreen_key,
            quit_key,
            needs_resize: false,
            is_minimized: false,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    /// Update the scene and draw one frame. Returns true if a frame was
    /// presented.
    fn redraw(&mut self) -> Result<bool> {
        if self.is_minimized {
            return Ok(false);
        }
        let (Some(viewer), Some(window)) = (self.viewer.as_mut(), self.window.as_ref()) else {
            return Ok(false);
        };

        if self.needs_resize {
            let size = window.inner_size();
            if size.width == 0 || size.height == 0 {
                self.is_minimized = true;
                return Ok(false);
            }
            viewer.device.wait_idle()?;
            viewer.create_swapchain_resources(size.width, size.height)?;
            self.needs_resize = false;
        }

        let now = Instant::now();
        let delta_seconds = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;

        viewer.update(delta_seconds)?;
        match viewer.render_frame() {
            Ok(FrameStatus::Presented) => Ok(true),
            Ok(FrameStatus::Stale) => {
                self.needs_resize = true;
                Ok(false)
            }
            Err(e) => {
                // An image acquired but never presented is released with
                // the old swapchain
                self.needs_resize = true;
                Err(e)
            }
        }
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }

            self.needs_resize = true;
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{}]",
                    self.config.window.title,
                    fps,
                    1000.0 / fps.max(f32::EPSILON),
                    mode
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        match Viewer::new(&self.config, &window) {
            Ok(viewer) => self.viewer = Some(viewer),
            Err(e) => {
                log::error!("Failed to initialize Vulkan: {:?}", e);
                event_loop.exit();
                return;
            }
        }

        self.last_frame_time = Instant::now();
        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);

                if size.width == 0 || size.height == 0 {
                    self.is_minimized = true;
                } else {
                    self.is_minimized = false;
                    self.needs_resize = true;
                }
            }

            WindowEvent::RedrawRequested => match self.redraw() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) => log::error!("Render error: {:?}", e),
            },

            WindowEvent::KeyboardInput { event, .. } => {
                if !event.state.is_pressed() || event.repeat {
                    return;
                }
                let PhysicalKey::Code(key) = event.physical_key else {
                    return;
                };
                if key == self.quit_key {
                    log::info!("{:?} pressed, exiting...", key);
                    event_loop.exit();
                } else if key == self.fullscreen_key {
                    self.toggle_fullscreen();
                } else if key == KeyCode::Tab {
                    if let Some(viewer) = self.viewer.as_mut() {
                        viewer.toggle_environment();
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        // GPU state first, while the window it presents to still exists
        self.viewer = None;
        log::info!("Cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_gets_header_then_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("viewer.log");
        std::fs::write(&path, "old run\n").unwrap();

        let mut file = open_log_file(&path).unwrap();
        writeln!(file, "INFO record").unwrap();
        drop(file);

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("=== Scene Viewer Log ==="));
        assert!(content.ends_with("INFO record\n"));
        assert!(!content.contains("old run"));
    }

    #[test]
    fn test_unwritable_log_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(open_log_file(&dir.path().join("missing").join("viewer.log")).is_err());
    }

    #[test]
    fn test_key_names() {
        assert_eq!(parse_key("F11"), Some(KeyCode::F11));
        assert_eq!(parse_key("esc"), Some(KeyCode::Escape));
        assert_eq!(parse_key("hyper"), None);
        assert_eq!(key_or("hyper", KeyCode::KeyQ), KeyCode::KeyQ);
    }
}
