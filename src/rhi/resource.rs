// Render resources - typed handles over the device's tracking list
//
// A resource is a backend-native object (owned exclusively by its tracked
// entry) plus a reference count. The count only moves through the device's
// release/add_ref entry points; when it reaches zero the entry is
// unregistered and the native object dropped, which is the single point
// where the backend destroys it.

use std::any::Any;

use super::debug;
use super::registry::{NodeHandle, TrackingList};
use super::types::{BufferDesc, DeviceId, InputLayoutDesc, ShaderStage, TextureDesc};

/// Kind discriminant shared by every resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Texture2D,
    RenderTarget,
    Buffer,
    VertexShader,
    PixelShader,
    InputLayout,
}

/// Backend-native object owned by a tracked resource
///
/// Dropping the box is the native release; implementations destroy their
/// API object in `Drop`.
pub trait NativeResource: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Raw API handle, for logs and leak reports
    fn raw_handle(&self) -> u64;
}

/// Untyped reference to a tracked resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceHandle {
    device: DeviceId,
    node: NodeHandle,
}

impl ResourceHandle {
    pub fn device(&self) -> DeviceId {
        self.device
    }
}

/// Typed resource handle returned by the device factories
pub trait RenderResource: Copy {
    const KIND: ResourceKind;

    fn handle(&self) -> ResourceHandle;
}

macro_rules! render_resources {
    ($($(#[$meta:meta])* $name:ident;)*) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub struct $name(ResourceHandle);

            impl $name {
                pub(crate) fn from_handle(handle: ResourceHandle) -> Self {
                    Self(handle)
                }
            }

            impl RenderResource for $name {
                const KIND: ResourceKind = ResourceKind::$name;

                fn handle(&self) -> ResourceHandle {
                    self.0
                }
            }
        )*
    };
}

render_resources! {
    /// 2D texture, including swap chain back buffers
    Texture2D;
    /// Color attachment view of a [`Texture2D`]
    RenderTarget;
    Buffer;
    VertexShader;
    PixelShader;
    InputLayout;
}

/// Creation-time description kept alongside the native object
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceDesc {
    Texture2D(TextureDesc),
    RenderTarget(TextureDesc),
    Buffer(BufferDesc),
    Shader {
        stage: ShaderStage,
        name: String,
    },
    InputLayout(InputLayoutDesc),
}

impl ResourceDesc {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceDesc::Texture2D(_) => ResourceKind::Texture2D,
            ResourceDesc::RenderTarget(_) => ResourceKind::RenderTarget,
            ResourceDesc::Buffer(_) => ResourceKind::Buffer,
            ResourceDesc::Shader {
                stage: ShaderStage::Vertex,
                ..
            } => ResourceKind::VertexShader,
            ResourceDesc::Shader {
                stage: ShaderStage::Pixel,
                ..
            } => ResourceKind::PixelShader,
            ResourceDesc::InputLayout(_) => ResourceKind::InputLayout,
        }
    }
}

pub struct TrackedResource {
    pub native: Box<dyn NativeResource>,
    pub ref_count: u32,
    /// Resource this one holds a reference on (render target -> texture)
    pub parent: Option<ResourceHandle>,
    pub desc: ResourceDesc,
}

/// Reference-counted registry of every resource a device owns
pub struct ResourceRegistry {
    device: DeviceId,
    list: TrackingList<TrackedResource>,
    debug_tracking: bool,
}

impl ResourceRegistry {
    pub fn new(device: DeviceId, debug_tracking: bool) -> Self {
        Self {
            device,
            list: TrackingList::new(),
            debug_tracking,
        }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn list(&self) -> &TrackingList<TrackedResource> {
        &self.list
    }

    /// Track a freshly created native object with a count of one.
    pub fn register(
        &mut self,
        native: Box<dyn NativeResource>,
        desc: ResourceDesc,
        parent: Option<ResourceHandle>,
    ) -> ResourceHandle {
        let kind = desc.kind();
        let raw = native.raw_handle();
        let node = self.list.register(TrackedResource {
            native,
            ref_count: 1,
            parent,
            desc,
        });

        if self.debug_tracking {
            debug::track(self.device, kind);
        }
        log::trace!("Registered {:?} 0x{:x} on device {}", kind, raw, self.device);

        ResourceHandle {
            device: self.device,
            node,
        }
    }

    pub fn get(&self, handle: ResourceHandle) -> Option<&TrackedResource> {
        if handle.device != self.device {
            return None;
        }
        self.list.get(handle.node)
    }

    pub fn get_mut(&mut self, handle: ResourceHandle) -> Option<&mut TrackedResource> {
        if handle.device != self.device {
            return None;
        }
        self.list.get_mut(handle.node)
    }

    pub fn contains(&self, handle: ResourceHandle) -> bool {
        self.get(handle).is_some()
    }

    pub fn ref_count(&self, handle: ResourceHandle) -> Option<u32> {
        self.get(handle).map(|entry| entry.ref_count)
    }

    pub fn desc(&self, handle: ResourceHandle) -> Option<&ResourceDesc> {
        self.get(handle).map(|entry| &entry.desc)
    }

    /// Native object behind a typed handle, checked against its kind
    ///
    /// A stale, foreign or mistyped handle is a caller bug: it is logged,
    /// asserted in debug builds, and resolves to `None`.
    pub fn native_of<R: RenderResource>(&self, resource: R) -> Option<&dyn NativeResource> {
        match self.get(resource.handle()) {
            Some(entry) if entry.desc.kind() == R::KIND => Some(entry.native.as_ref()),
            _ => {
                self.report_invalid(R::KIND, resource.handle());
                None
            }
        }
    }

    pub fn native_of_mut<R: RenderResource>(
        &mut self,
        resource: R,
    ) -> Option<(&mut dyn NativeResource, &ResourceDesc)> {
        let handle = resource.handle();
        let valid = matches!(self.get(handle), Some(entry) if entry.desc.kind() == R::KIND);
        if !valid {
            self.report_invalid(R::KIND, handle);
            return None;
        }
        self.get_mut(handle)
            .map(|entry| (entry.native.as_mut(), &entry.desc))
    }

    pub fn add_ref(&mut self, handle: ResourceHandle) -> Option<u32> {
        let entry = self.get_mut(handle)?;
        entry.ref_count += 1;
        Some(entry.ref_count)
    }

    /// Drop one reference. At zero the resource is unregistered, its native
    /// object destroyed, and the reference it held on its parent released.
    ///
    /// Returns the post-decrement count, or `None` for an untracked handle.
    pub fn release(&mut self, handle: ResourceHandle) -> Option<u32> {
        let entry = self.get_mut(handle)?;
        entry.ref_count = entry.ref_count.saturating_sub(1);
        let remaining = entry.ref_count;

        if remaining == 0 {
            self.destroy(handle);
        }
        Some(remaining)
    }

    fn destroy(&mut self, handle: ResourceHandle) {
        let Some(entry) = self.list.unregister(handle.node) else {
            return;
        };
        let kind = entry.desc.kind();
        let parent = entry.parent;

        if self.debug_tracking {
            debug::untrack(self.device, kind);
        }
        log::trace!(
            "Destroying {:?} 0x{:x} on device {}",
            kind,
            entry.native.raw_handle(),
            self.device
        );
        drop(entry);

        if let Some(parent) = parent {
            if self.release(parent).is_none() {
                log::warn!("Parent of released {:?} was already gone", kind);
            }
        }
    }

    /// Walk the list tail to head, releasing each resource until its count
    /// reaches zero. Children are always registered after their parent, so
    /// a view goes before the texture it was created from. Returns how many
    /// resources were destroyed.
    pub fn force_release_all(&mut self) -> usize {
        let before = self.list.len();
        let mut cursor = self.list.tail();

        while let Some(node) = cursor {
            let prev = self.list.prev(node);
            let handle = ResourceHandle {
                device: self.device,
                node,
            };
            while let Some(count) = self.release(handle) {
                if count == 0 {
                    break;
                }
            }

            // Releasing a child may have destroyed its parent, which can be
            // the node we were about to visit.
            cursor = match prev {
                Some(prev) if self.list.contains(prev) => Some(prev),
                _ => self.list.tail(),
            };
        }

        before - self.list.len()
    }

    /// Forget every entry without running the release protocol.
    pub fn clear(&mut self) {
        if self.debug_tracking {
            for (_, entry) in self.list.iter() {
                debug::untrack(self.device, entry.desc.kind());
            }
        }
        self.list.clear();
    }

    fn report_invalid(&self, kind: ResourceKind, handle: ResourceHandle) {
        log::error!(
            "Invalid {:?} handle {:?} used on device {}",
            kind,
            handle,
            self.device
        );
        debug_assert!(false, "invalid {kind:?} handle used on device {}", self.device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rhi::testing::Recorder;
    use crate::rhi::types::{BindFlags, BufferUsage, CpuAccessFlags, RenderFormat};
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Native that appends its name to a shared log when dropped
    struct Named {
        name: &'static str,
        dropped: Rc<RefCell<Vec<&'static str>>>,
    }

    impl NativeResource for Named {
        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }

        fn raw_handle(&self) -> u64 {
            0
        }
    }

    impl Drop for Named {
        fn drop(&mut self) {
            self.dropped.borrow_mut().push(self.name);
        }
    }

    fn buffer_desc() -> ResourceDesc {
        ResourceDesc::Buffer(BufferDesc {
            size_in_bytes: 16,
            stride_in_bytes: 0,
            usage: BufferUsage::Default,
            bind_flags: BindFlags::CONSTANT_BUFFER,
            cpu_access: CpuAccessFlags::empty(),
        })
    }

    fn texture_desc() -> TextureDesc {
        TextureDesc::render_target(4, 4, RenderFormat::R8G8B8A8Unorm)
    }

    #[test]
    fn release_to_zero_destroys_native() {
        let recorder = Recorder::default();
        let mut registry = ResourceRegistry::new(DeviceId::next(), false);
        let handle = registry.register(recorder.native(0), buffer_desc(), None);

        assert_eq!(registry.add_ref(handle), Some(2));
        assert_eq!(registry.release(handle), Some(1));
        assert_eq!(recorder.live_natives(), 1);
        assert_eq!(registry.release(handle), Some(0));

        assert_eq!(recorder.live_natives(), 0);
        assert!(registry.is_empty());
        assert_eq!(registry.release(handle), None);
    }

    #[test]
    fn child_release_drops_parent_reference() {
        let recorder = Recorder::default();
        let mut registry = ResourceRegistry::new(DeviceId::next(), false);
        let texture = registry.register(
            recorder.native(0),
            ResourceDesc::Texture2D(texture_desc()),
            None,
        );
        registry.add_ref(texture);
        let target = registry.register(
            recorder.native(0),
            ResourceDesc::RenderTarget(texture_desc()),
            Some(texture),
        );

        assert_eq!(registry.release(target), Some(0));
        assert_eq!(registry.ref_count(texture), Some(1));
        assert_eq!(registry.release(texture), Some(0));
        assert!(registry.is_empty());
    }

    #[test]
    fn force_release_handles_parents_visited_later() {
        let dropped = Rc::new(RefCell::new(Vec::new()));
        let named = |name| {
            Box::new(Named {
                name,
                dropped: dropped.clone(),
            })
        };
        let mut registry = ResourceRegistry::new(DeviceId::next(), false);
        let standalone = registry.register(named("buffer"), buffer_desc(), None);
        registry.add_ref(standalone);
        registry.add_ref(standalone);
        let texture = registry.register(
            named("texture"),
            ResourceDesc::Texture2D(texture_desc()),
            None,
        );
        registry.add_ref(texture);
        registry.register(
            named("render_target"),
            ResourceDesc::RenderTarget(texture_desc()),
            Some(texture),
        );

        assert_eq!(registry.force_release_all(), 3);
        assert!(registry.is_empty());
        assert!(registry.list().head().is_none());
        assert!(registry.list().tail().is_none());
        assert_eq!(*dropped.borrow(), vec!["render_target", "texture", "buffer"]);
    }

    #[test]
    fn force_release_restarts_when_parent_goes_with_child() {
        let recorder = Recorder::default();
        let mut registry = ResourceRegistry::new(DeviceId::next(), false);
        registry.register(recorder.native(0), buffer_desc(), None);
        let texture = registry.register(
            recorder.native(0),
            ResourceDesc::Texture2D(texture_desc()),
            None,
        );
        // the render target holds the only reference left on its texture
        registry.register(
            recorder.native(0),
            ResourceDesc::RenderTarget(texture_desc()),
            Some(texture),
        );

        assert_eq!(registry.force_release_all(), 3);
        assert!(registry.is_empty());
        assert_eq!(recorder.live_natives(), 0);
    }

    #[test]
    fn handles_from_other_devices_do_not_resolve() {
        let recorder = Recorder::default();
        let mut first = ResourceRegistry::new(DeviceId::next(), false);
        let second = ResourceRegistry::new(DeviceId::next(), false);
        let handle = first.register(recorder.native(0), buffer_desc(), None);

        assert!(first.contains(handle));
        assert!(!second.contains(handle));
        assert_eq!(second.ref_count(handle), None);
    }

    #[test]
    fn kind_follows_shader_stage() {
        let vertex = ResourceDesc::Shader {
            stage: ShaderStage::Vertex,
            name: "vs".into(),
        };
        let pixel = ResourceDesc::Shader {
            stage: ShaderStage::Pixel,
            name: "ps".into(),
        };
        assert_eq!(vertex.kind(), ResourceKind::VertexShader);
        assert_eq!(pixel.kind(), ResourceKind::PixelShader);
    }
}
