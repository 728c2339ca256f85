// SPDX-License-Identifier: CEPL-1.0
//! Needs a Vulkan loader; returns early on machines without one.
use kestrel_render_vk::{DeviceContext, VkError};

#[test]
fn initialize_twice_keeps_one_instance() {
    let ctx = match DeviceContext::new(false) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("skipping: {e}");
            return;
        }
    };
    assert!(!ctx.is_initialized());
    assert!(matches!(ctx.instance(), Err(VkError::NotInitialized(_))));

    if let Err(e) = ctx.initialize("kestrel-test", None) {
        eprintln!("skipping: {e}");
        return;
    }
    let first = ctx.instance().expect("instance after initialize").handle();

    ctx.initialize("kestrel-test", None)
        .expect("second initialize is a no-op");
    let second = ctx.instance().expect("instance still present").handle();
    assert_eq!(first, second);
}

#[test]
fn device_accessors_fail_before_creation() {
    let Ok(ctx) = DeviceContext::new(false) else {
        return;
    };
    assert!(matches!(ctx.device(), Err(VkError::NotInitialized(_))));
    assert!(matches!(ctx.adapter(), Err(VkError::NotInitialized(_))));
    assert!(matches!(ctx.graphics_queue(), Err(VkError::NotInitialized(_))));
}
