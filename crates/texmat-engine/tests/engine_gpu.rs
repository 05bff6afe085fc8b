//! Device-dependent end-to-end tests. Every test acquires its own
//! engine and skips (with a note) on machines without a GPU adapter.

use texmat_api::{DType, HostBuffer, PixelData};
use texmat_engine::{Engine, EngineOptions, Kernel, StorageMode, WriteRegion};

fn engine_with(options: EngineOptions) -> Option<Engine> {
    let _ = env_logger::builder().is_test(true).try_init();
    match Engine::new(options) {
        Ok(engine) => Some(engine),
        Err(err) => {
            eprintln!("skipping GPU test: {err}");
            None
        }
    }
}

fn engine() -> Option<Engine> {
    engine_with(EngineOptions::default())
}

fn floats(buffer: &HostBuffer) -> Vec<f32> {
    match buffer {
        HostBuffer::F32(v) => v.clone(),
        other => panic!("expected f32 buffer, got {other:?}"),
    }
}

fn assert_close(actual: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tol,
            "element {i}: got {a}, expected {e} (tol {tol})"
        );
    }
}

#[test]
fn multiply_by_ones_is_identity() {
    let Some(mut engine) = engine() else { return };
    let a = engine.register(&[4, 4], DType::F32).unwrap();
    let ones = engine.register(&[4, 4], DType::F32).unwrap();
    let data: Vec<f32> = (0..16).map(|i| (i as f32 - 7.5) * 1.25).collect();
    engine.write(a.id, &HostBuffer::F32(data.clone())).unwrap();
    engine.write(ones.id, &HostBuffer::F32(vec![1.0; 16])).unwrap();

    let out = engine.execute_kernel(Kernel::Mul, &[&a, &ones], None).unwrap();
    assert_eq!(out.shape, vec![4, 4]);
    let result = floats(&engine.read(out.id).unwrap());
    assert_close(&result, &data, 1e-6);
    engine.dispose().unwrap();
}

#[test]
fn broadcast_add_column_against_row() {
    let Some(mut engine) = engine() else { return };
    let a = engine.register(&[3, 1], DType::F32).unwrap();
    let b = engine.register(&[1, 4], DType::F32).unwrap();
    engine.write(a.id, &HostBuffer::F32(vec![1.0, 2.0, 3.0])).unwrap();
    engine
        .write(b.id, &HostBuffer::F32(vec![10.0, 20.0, 30.0, 40.0]))
        .unwrap();

    let out = engine.execute_kernel(Kernel::Add, &[&a, &b], None).unwrap();
    assert_eq!(out.shape, vec![3, 4]);
    let result = floats(&engine.read_sync(out.id).unwrap());
    let expected = [
        11.0, 21.0, 31.0, 41.0, //
        12.0, 22.0, 32.0, 42.0, //
        13.0, 23.0, 33.0, 43.0,
    ];
    assert_close(&result, &expected, 1e-6);
    engine.dispose().unwrap();
}

#[test]
fn scalar_broadcasts_against_everything() {
    let Some(mut engine) = engine() else { return };
    let a = engine.register(&[2, 2], DType::F32).unwrap();
    let s = engine.register(&[], DType::F32).unwrap();
    engine
        .write(a.id, &HostBuffer::F32(vec![1.0, 2.0, 3.0, 4.0]))
        .unwrap();
    engine.write(s.id, &HostBuffer::F32(vec![10.0])).unwrap();

    let out = engine.execute_kernel(Kernel::Mul, &[&a, &s], None).unwrap();
    let result = floats(&engine.read(out.id).unwrap());
    assert_close(&result, &[10.0, 20.0, 30.0, 40.0], 1e-6);
    engine.dispose().unwrap();
}

#[test]
fn unary_kernels_apply_elementwise() {
    let Some(mut engine) = engine() else { return };
    let x = engine.register(&[5], DType::F32).unwrap();
    let data = vec![-2.0, -0.5, 0.0, 0.5, 2.0];
    engine.write(x.id, &HostBuffer::F32(data.clone())).unwrap();

    let neg = engine.execute_kernel(Kernel::Neg, &[&x], None).unwrap();
    assert_close(
        &floats(&engine.read(neg.id).unwrap()),
        &[2.0, 0.5, 0.0, -0.5, -2.0],
        1e-6,
    );

    let abs = engine.execute_kernel(Kernel::Abs, &[&x], None).unwrap();
    assert_close(
        &floats(&engine.read(abs.id).unwrap()),
        &[2.0, 0.5, 0.0, 0.5, 2.0],
        1e-6,
    );

    let relu = engine.execute_kernel(Kernel::Relu, &[&x], None).unwrap();
    assert_close(
        &floats(&engine.read(relu.id).unwrap()),
        &[0.0, 0.0, 0.0, 0.5, 2.0],
        1e-6,
    );

    let exp = engine.execute_kernel(Kernel::Exp, &[&x], None).unwrap();
    let expected: Vec<f32> = data.iter().map(|v| v.exp()).collect();
    assert_close(&floats(&engine.read(exp.id).unwrap()), &expected, 1e-4);
    engine.dispose().unwrap();
}

#[test]
fn matmul_matches_host_computation() {
    let Some(mut engine) = engine() else { return };
    let a = engine.register(&[2, 3], DType::F32).unwrap();
    let b = engine.register(&[3, 2], DType::F32).unwrap();
    engine
        .write(a.id, &HostBuffer::F32(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]))
        .unwrap();
    engine
        .write(b.id, &HostBuffer::F32(vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0]))
        .unwrap();

    let out = engine.execute_kernel(Kernel::MatMul, &[&a, &b], None).unwrap();
    assert_eq!(out.shape, vec![2, 2]);
    let result = floats(&engine.read(out.id).unwrap());
    assert_close(&result, &[58.0, 64.0, 139.0, 154.0], 1e-4);
    engine.dispose().unwrap();
}

#[test]
fn identical_dispatches_compile_once() {
    let Some(mut engine) = engine() else { return };
    let a = engine.register(&[4, 4], DType::F32).unwrap();
    let b = engine.register(&[4, 4], DType::F32).unwrap();
    engine.write(a.id, &HostBuffer::F32(vec![1.0; 16])).unwrap();
    engine.write(b.id, &HostBuffer::F32(vec![2.0; 16])).unwrap();

    let first = engine.execute_kernel(Kernel::Add, &[&a, &b], None).unwrap();
    assert_eq!(engine.program_compile_count(), 1);
    let second = engine.execute_kernel(Kernel::Add, &[&a, &b], None).unwrap();
    assert_eq!(engine.program_compile_count(), 1, "same signature recompiled");

    // A different logical shape is a different signature.
    let c = engine.register(&[2, 8], DType::F32).unwrap();
    let d = engine.register(&[2, 8], DType::F32).unwrap();
    engine.write(c.id, &HostBuffer::F32(vec![1.0; 16])).unwrap();
    engine.write(d.id, &HostBuffer::F32(vec![2.0; 16])).unwrap();
    engine.execute_kernel(Kernel::Add, &[&c, &d], None).unwrap();
    assert_eq!(engine.program_compile_count(), 2);

    let r1 = floats(&engine.read(first.id).unwrap());
    let r2 = floats(&engine.read(second.id).unwrap());
    assert_close(&r1, &vec![3.0; 16], 1e-6);
    assert_close(&r2, &vec![3.0; 16], 1e-6);
    engine.dispose().unwrap();
}

#[test]
fn read_releases_textures_for_reuse() {
    let Some(mut engine) = engine() else { return };
    let a = engine.register(&[8, 8], DType::F32).unwrap();
    let b = engine.register(&[8, 8], DType::F32).unwrap();
    engine.write(a.id, &HostBuffer::F32(vec![1.0; 64])).unwrap();
    engine.write(b.id, &HostBuffer::F32(vec![2.0; 64])).unwrap();

    let out = engine.execute_kernel(Kernel::Add, &[&a, &b], None).unwrap();
    let (_, _, allocated_before) = engine.texture_pool_stats();
    engine.read(out.id).unwrap();
    let (_, free_after_read, _) = engine.texture_pool_stats();
    assert!(free_after_read > 0, "read should return the texture to the pool");

    // Same output signature again: the freed texture must be reused.
    let out2 = engine.execute_kernel(Kernel::Add, &[&a, &b], None).unwrap();
    let (_, _, allocated_after) = engine.texture_pool_stats();
    assert_eq!(allocated_before, allocated_after, "pool allocated a new texture");
    engine.read(out2.id).unwrap();
    engine.dispose().unwrap();
}

#[test]
fn write_region_narrows_the_output() {
    let Some(mut engine) = engine() else { return };
    if engine.storage_mode() != StorageMode::NativeFloat {
        // Zero texels are the quantized NaN sentinel, so the cleared
        // remainder would not read back as 0.0.
        eprintln!("skipping region test: no native float storage");
        engine.dispose().unwrap();
        return;
    }
    let a = engine.register(&[4, 4], DType::F32).unwrap();
    let b = engine.register(&[4, 4], DType::F32).unwrap();
    engine.write(a.id, &HostBuffer::F32(vec![1.0; 16])).unwrap();
    engine.write(b.id, &HostBuffer::F32(vec![2.0; 16])).unwrap();

    let region = WriteRegion {
        row: 0,
        col: 0,
        rows: 2,
        cols: 4,
    };
    let out = engine
        .execute_kernel(Kernel::Add, &[&a, &b], Some(region))
        .unwrap();
    let result = floats(&engine.read(out.id).unwrap());
    let mut expected = vec![3.0; 8];
    expected.extend(vec![0.0; 8]);
    assert_close(&result, &expected, 1e-6);
    engine.dispose().unwrap();
}

#[test]
fn region_writes_on_reused_textures_start_from_zero() {
    let Some(mut engine) = engine() else { return };
    if engine.storage_mode() != StorageMode::NativeFloat {
        eprintln!("skipping region test: no native float storage");
        engine.dispose().unwrap();
        return;
    }
    let a = engine.register(&[4, 4], DType::F32).unwrap();
    let b = engine.register(&[4, 4], DType::F32).unwrap();
    engine.write(a.id, &HostBuffer::F32(vec![1.0; 16])).unwrap();
    engine.write(b.id, &HostBuffer::F32(vec![2.0; 16])).unwrap();

    // Fill a texture with 3.0s everywhere and return it to the pool.
    let full = engine.execute_kernel(Kernel::Add, &[&a, &b], None).unwrap();
    engine.read(full.id).unwrap();

    // The region dispatch reuses that texture; outside the region the
    // previous tensor's values must not show through.
    let region = WriteRegion {
        row: 0,
        col: 0,
        rows: 1,
        cols: 4,
    };
    let out = engine
        .execute_kernel(Kernel::Add, &[&a, &b], Some(region))
        .unwrap();
    let result = floats(&engine.read(out.id).unwrap());
    let mut expected = vec![3.0; 4];
    expected.extend(vec![0.0; 12]);
    assert_close(&result, &expected, 1e-6);
    engine.dispose().unwrap();
}

#[test]
fn unwritten_tensors_cannot_feed_kernels() {
    let Some(mut engine) = engine() else { return };
    let a = engine.register(&[2, 2], DType::F32).unwrap();
    let written = engine.register(&[2, 2], DType::F32).unwrap();
    engine
        .write(written.id, &HostBuffer::F32(vec![1.0; 4]))
        .unwrap();
    assert!(engine.execute_kernel(Kernel::Neg, &[&a], None).is_err());
    assert!(engine
        .execute_kernel(Kernel::Add, &[&a, &written], None)
        .is_err());
    assert!(engine.read(a.id).is_err());
    engine.dispose().unwrap();
}

#[test]
fn out_of_bounds_write_region_is_rejected() {
    let Some(mut engine) = engine() else { return };
    let a = engine.register(&[4, 4], DType::F32).unwrap();
    let b = engine.register(&[4, 4], DType::F32).unwrap();
    engine.write(a.id, &HostBuffer::F32(vec![1.0; 16])).unwrap();
    engine.write(b.id, &HostBuffer::F32(vec![2.0; 16])).unwrap();
    let region = WriteRegion {
        row: 3,
        col: 0,
        rows: 4,
        cols: 4,
    };
    assert!(engine
        .execute_kernel(Kernel::Add, &[&a, &b], Some(region))
        .is_err());
    engine.dispose().unwrap();
}

#[test]
fn rank3_tensors_dispatch_through_folded_textures() {
    let Some(mut engine) = engine() else { return };
    let a = engine.register(&[2, 2, 3], DType::F32).unwrap();
    let data: Vec<f32> = (0..12).map(|i| i as f32).collect();
    engine.write(a.id, &HostBuffer::F32(data.clone())).unwrap();

    let out = engine.execute_kernel(Kernel::Neg, &[&a], None).unwrap();
    let result = floats(&engine.read(out.id).unwrap());
    let expected: Vec<f32> = data.iter().map(|v| -v).collect();
    assert_close(&result, &expected, 1e-6);
    engine.dispose().unwrap();
}

#[test]
fn from_pixels_materializes_channel_values() {
    let Some(mut engine) = engine() else { return };
    let pixels = PixelData {
        width: 2,
        height: 2,
        data: vec![
            10, 20, 30, 255, //
            40, 50, 60, 255, //
            70, 80, 90, 255, //
            100, 110, 120, 255,
        ],
    };
    let out = engine.from_pixels(&pixels, 3).unwrap();
    assert_eq!(out.shape, vec![2, 2, 3]);
    assert_eq!(out.dtype, DType::I32);
    let result = engine.read(out.id).unwrap();
    let HostBuffer::I32(values) = result else {
        panic!("expected i32 buffer");
    };
    assert_eq!(
        values,
        vec![10, 20, 30, 40, 50, 60, 70, 80, 90, 100, 110, 120]
    );
    engine.dispose().unwrap();
}

#[test]
fn quantized_mode_round_trips_within_tolerance() {
    let mut options = EngineOptions::default();
    options.forced_storage_mode = Some(StorageMode::Quantized);
    let Some(mut engine) = engine_with(options) else { return };
    assert_eq!(engine.storage_mode(), StorageMode::Quantized);

    let a = engine.register(&[2, 2], DType::F32).unwrap();
    let b = engine.register(&[2, 2], DType::F32).unwrap();
    engine
        .write(a.id, &HostBuffer::F32(vec![1.25, -3.5, 10.0, 0.0]))
        .unwrap();
    engine
        .write(b.id, &HostBuffer::F32(vec![2.0, 2.0, 2.0, 2.0]))
        .unwrap();

    let out = engine.execute_kernel(Kernel::Add, &[&a, &b], None).unwrap();
    let result = floats(&engine.read(out.id).unwrap());
    assert_close(&result, &[3.25, -1.5, 12.0, 2.0], 1e-2);
    engine.dispose().unwrap();
}

#[test]
fn packed_write_read_round_trips() {
    let Some(mut engine) = engine() else { return };
    if engine.storage_mode() != StorageMode::NativeFloat {
        eprintln!("skipping packed test: no native float storage");
        engine.dispose().unwrap();
        return;
    }
    let m = engine.register(&[3, 5], DType::F32).unwrap();
    let data: Vec<f32> = (0..15).map(|i| i as f32 * 0.5).collect();
    engine.write_packed(m.id, &HostBuffer::F32(data.clone())).unwrap();
    let result = floats(&engine.read(m.id).unwrap());
    assert_close(&result, &data, 1e-6);

    // Packed tensors are storage-only: kernels must reject them.
    assert!(engine.execute_kernel(Kernel::Neg, &[&m], None).is_err());
    engine.dispose().unwrap();
}

#[test]
fn async_and_sync_reads_agree() {
    let Some(mut engine) = engine() else { return };
    let a = engine.register(&[16], DType::F32).unwrap();
    let b = engine.register(&[16], DType::F32).unwrap();
    let data: Vec<f32> = (0..16).map(|i| i as f32).collect();
    engine.write(a.id, &HostBuffer::F32(data.clone())).unwrap();
    engine.write(b.id, &HostBuffer::F32(data.clone())).unwrap();

    let s = engine.execute_kernel(Kernel::Add, &[&a, &b], None).unwrap();
    let polled = floats(&engine.read(s.id).unwrap());

    let s2 = engine.execute_kernel(Kernel::Add, &[&a, &b], None).unwrap();
    let blocking = floats(&engine.read_sync(s2.id).unwrap());
    assert_eq!(polled, blocking);
    engine.dispose().unwrap();
}

#[test]
fn mismatched_operands_fail_fast() {
    let Some(mut engine) = engine() else { return };
    let a = engine.register(&[3, 2], DType::F32).unwrap();
    let b = engine.register(&[3, 4], DType::F32).unwrap();
    assert!(engine.execute_kernel(Kernel::Add, &[&a, &b], None).is_err());
    assert!(engine.execute_kernel(Kernel::MatMul, &[&a, &b], None).is_err());
    // Failed dispatches must not leak output records.
    assert!(engine.execute_kernel(Kernel::Add, &[&a], None).is_err());
    engine.dispose().unwrap();
}

#[test]
fn disposed_tensor_use_is_an_error() {
    let Some(mut engine) = engine() else { return };
    let a = engine.register(&[2], DType::F32).unwrap();
    engine.write(a.id, &HostBuffer::F32(vec![1.0, 2.0])).unwrap();
    engine.dispose_tensor(a.id).unwrap();
    assert!(engine.read(a.id).is_err());
    assert!(engine.execute_kernel(Kernel::Neg, &[&a], None).is_err());
    engine.dispose().unwrap();
}

#[test]
fn debug_validation_mode_still_computes() {
    let mut options = EngineOptions::default();
    options.debug_validation = true;
    let Some(mut engine) = engine_with(options) else { return };
    let a = engine.register(&[4], DType::F32).unwrap();
    engine
        .write(a.id, &HostBuffer::F32(vec![1.0, 2.0, 3.0, 4.0]))
        .unwrap();
    let out = engine.execute_kernel(Kernel::Exp, &[&a], None).unwrap();
    let result = floats(&engine.read(out.id).unwrap());
    assert!((result[1] - 2.0f32.exp()).abs() < 1e-4);
    engine.dispose().unwrap();
}
