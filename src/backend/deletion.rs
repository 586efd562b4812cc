// Deferred destruction
//
// GPU work runs behind the CPU, so a resource can only be destroyed once the
// fence guarding its last use has signaled. Resources are parked in a
// DeletionQueue and destroyed in reverse registration order on flush, which
// keeps dependents (views, sets) ahead of the objects they depend on.

use ash::vk::{self, Handle};

use super::allocator::{AllocatedImage, ResourceAllocator};

/// Ordered list of deferred destructions, executed LIFO.
///
/// A queue is owned by exactly one frame slot or by the renderer itself and is
/// never shared between threads.
pub struct DeletionQueue<T> {
    pending: Vec<T>,
}

impl<T> DeletionQueue<T> {
    pub const fn new() -> Self {
        Self { pending: Vec::new() }
    }

    /// Park an entry. Nothing is destroyed until the next flush.
    pub fn defer(&mut self, entry: T) {
        self.pending.push(entry);
    }

    /// Hand every entry to `destroy`, newest first, leaving the queue empty.
    pub fn flush(&mut self, mut destroy: impl FnMut(T)) {
        while let Some(entry) = self.pending.pop() {
            destroy(entry);
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl<T> Default for DeletionQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for DeletionQueue<T> {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            log::warn!(
                "Deletion queue dropped with {} unflushed entries",
                self.pending.len()
            );
        }
    }
}

/// A GPU object awaiting destruction.
#[derive(Debug)]
pub enum GpuResource {
    CommandPool(vk::CommandPool),
    Fence(vk::Fence),
    Semaphore(vk::Semaphore),
    DescriptorPool(vk::DescriptorPool),
    DescriptorSetLayout(vk::DescriptorSetLayout),
    Pipeline(vk::Pipeline),
    PipelineLayout(vk::PipelineLayout),
    ShaderModule(vk::ShaderModule),
    Image(AllocatedImage),
}

impl GpuResource {
    pub fn kind(&self) -> &'static str {
        match self {
            GpuResource::CommandPool(_) => "command pool",
            GpuResource::Fence(_) => "fence",
            GpuResource::Semaphore(_) => "semaphore",
            GpuResource::DescriptorPool(_) => "descriptor pool",
            GpuResource::DescriptorSetLayout(_) => "descriptor set layout",
            GpuResource::Pipeline(_) => "pipeline",
            GpuResource::PipelineLayout(_) => "pipeline layout",
            GpuResource::ShaderModule(_) => "shader module",
            GpuResource::Image(_) => "image",
        }
    }

    /// Destroy the object. Null handles are skipped.
    ///
    /// Images go back through the allocator when one is available; without it
    /// the handles are destroyed and the allocation is dropped unreleased.
    pub fn destroy(self, device: &ash::Device, allocator: Option<&mut ResourceAllocator>) {
        log::trace!("Destroying {}", self.kind());

        unsafe {
            match self {
                GpuResource::CommandPool(pool) if live(pool) => {
                    device.destroy_command_pool(pool, None);
                }
                GpuResource::Fence(fence) if live(fence) => {
                    device.destroy_fence(fence, None);
                }
                GpuResource::Semaphore(semaphore) if live(semaphore) => {
                    device.destroy_semaphore(semaphore, None);
                }
                GpuResource::DescriptorPool(pool) if live(pool) => {
                    device.destroy_descriptor_pool(pool, None);
                }
                GpuResource::DescriptorSetLayout(layout) if live(layout) => {
                    device.destroy_descriptor_set_layout(layout, None);
                }
                GpuResource::Pipeline(pipeline) if live(pipeline) => {
                    device.destroy_pipeline(pipeline, None);
                }
                GpuResource::PipelineLayout(layout) if live(layout) => {
                    device.destroy_pipeline_layout(layout, None);
                }
                GpuResource::ShaderModule(module) if live(module) => {
                    device.destroy_shader_module(module, None);
                }
                GpuResource::Image(image) => match allocator {
                    Some(allocator) => allocator.destroy_image(image),
                    None => {
                        log::warn!("Destroying image without an allocator; its memory is leaked");
                        image.destroy_handles(device);
                    }
                },
                _ => {}
            }
        }
    }
}

fn live<H: Handle>(handle: H) -> bool {
    handle.as_raw() != 0
}

impl DeletionQueue<GpuResource> {
    /// Destroy every parked GPU object, newest first.
    pub fn flush_gpu(&mut self, device: &ash::Device, mut allocator: Option<&mut ResourceAllocator>) {
        if self.is_empty() {
            return;
        }
        log::debug!("Flushing {} deferred GPU resources", self.len());
        self.flush(|resource| resource.destroy(device, allocator.as_deref_mut()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_runs_entries_newest_first() {
        let mut queue = DeletionQueue::new();
        for i in 1..=5 {
            queue.defer(i);
        }

        let mut order = Vec::new();
        queue.flush(|i| order.push(i));

        assert_eq!(order, vec![5, 4, 3, 2, 1]);
        assert!(queue.is_empty());
    }

    #[test]
    fn flush_on_empty_queue_does_nothing() {
        let mut queue: DeletionQueue<u32> = DeletionQueue::new();
        let mut calls = 0;
        queue.flush(|_| calls += 1);
        queue.flush(|_| calls += 1);
        assert_eq!(calls, 0);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn closures_run_in_reverse_registration_order() {
        let log = std::cell::RefCell::new(Vec::new());
        let mut queue: DeletionQueue<Box<dyn FnOnce() + '_>> = DeletionQueue::new();
        queue.defer(Box::new(|| log.borrow_mut().push("f1")));
        queue.defer(Box::new(|| log.borrow_mut().push("f2")));

        queue.flush(|action| action());

        assert_eq!(*log.borrow(), vec!["f2", "f1"]);
    }

    #[test]
    fn queue_is_reusable_after_flush() {
        let mut queue = DeletionQueue::new();
        queue.defer("view");
        queue.flush(|_| {});

        queue.defer("image");
        queue.defer("view");
        assert_eq!(queue.len(), 2);

        let mut order = Vec::new();
        queue.flush(|name| order.push(name));
        assert_eq!(order, vec!["view", "image"]);
    }

    #[test]
    fn resource_kinds_are_named() {
        assert_eq!(GpuResource::Fence(vk::Fence::null()).kind(), "fence");
        assert_eq!(
            GpuResource::DescriptorSetLayout(vk::DescriptorSetLayout::null()).kind(),
            "descriptor set layout"
        );
    }
}
