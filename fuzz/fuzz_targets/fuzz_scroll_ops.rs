#![no_main]

use libfuzzer_sys::fuzz_target;
use tgflow_scroll::{Controller, ScrollConfig};

/// Keep list sizes bounded so each input runs quickly.
const MAX_APPEND: usize = 4_096;
const MAX_OPS: usize = 512;

fn f64_from(bytes: &[u8]) -> f64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[..n].copy_from_slice(&bytes[..n]);
    f64::from_le_bytes(buf)
}

fuzz_target!(|data: &[u8]| {
    let Some((&header, rest)) = data.split_first() else {
        return;
    };
    let config = ScrollConfig {
        container_height: f64::from(header & 0x0f) * 64.0,
        item_height: f64::from((header >> 4) + 1) * 8.0,
        dynamic_height: header & 0x80 != 0,
        buffer_size: usize::from(header & 0x07),
        max_measured_heights: 32,
        ..ScrollConfig::default()
    };
    let Ok(mut controller) = Controller::<u32>::new(config) else {
        return;
    };

    for op in rest.chunks(9).take(MAX_OPS) {
        let Some((&tag, arg)) = op.split_first() else {
            continue;
        };
        let value = f64_from(arg);
        let index = arg.first().copied().map(usize::from).unwrap_or_default();
        match tag % 6 {
            0 => {
                let n = (index * 16).min(MAX_APPEND) as u32;
                controller.set_items(0..n, tag & 0x80 != 0);
            }
            1 => {
                controller.handle_scroll(value);
            }
            2 => {
                let px = arg.get(1).copied().map(f64::from).unwrap_or_default();
                controller.report_measured_height(index, px);
            }
            3 => {
                let _ = controller.update_container_height(value);
            }
            4 => {
                let _ = controller.scroll_to_index(index);
            }
            _ => {
                if tag & 0x40 != 0 {
                    controller.destroy();
                }
            }
        }

        let state = controller.state();
        let range = state.visible_range;
        assert!(range.start <= range.end);
        assert!(range.end <= controller.len());
        assert_eq!(range.is_empty(), controller.is_empty());
        assert!(state.total_height.is_finite() && state.total_height >= 0.0);
        assert_eq!(controller.visible_items().len(), range.len());
    }
});
