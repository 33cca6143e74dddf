//! Global arrays striped over an in-process group.

use anyhow::Result;
use bsp_runtime::{addr_of_mut, Bsp, ChannelMesh};

fn run_group<T, F>(nprocs: usize, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(Bsp) -> bsp_runtime::Result<T> + Send + Sync + Copy + 'static,
{
    let handles: Vec<_> = ChannelMesh::mesh(nprocs)
        .into_iter()
        .map(|tp| std::thread::spawn(move || f(Bsp::init(Box::new(tp))?)))
        .collect();
    handles
        .into_iter()
        .map(|h| h.join().expect("rank panicked").expect("rank failed"))
        .collect()
}

/// Rank 0 writes a pattern spanning every slice; every rank reads its own
/// window back.
#[test]
fn global_put_then_get_round_trip() -> Result<()> {
    let results = run_group(4, |mut bsp| {
        let p = bsp.pid();
        let h = bsp.global_alloc(16)?;
        bsp.sync()?;

        if p == 0 {
            let pattern: Vec<u8> = (0..16).collect();
            bsp.global_put(&pattern, h, 0)?;
        }
        bsp.sync()?;

        // Each rank fetches the 4 bytes starting at its own slice origin.
        let mut window = [0u8; 4];
        unsafe { bsp.global_get(h, 4 * p, addr_of_mut(&mut window), 4)? };
        bsp.sync()?;

        bsp.global_free(h)?;
        bsp.sync()?;
        bsp.end()?;
        Ok((p, window))
    });
    for (p, window) in results {
        let expect: [u8; 4] = std::array::from_fn(|i| (4 * p + i) as u8);
        assert_eq!(window, expect);
    }
    Ok(())
}

/// A write that straddles two slices is split into per-rank puts.
#[test]
fn global_put_straddles_slice_boundary() -> Result<()> {
    let results = run_group(2, |mut bsp| {
        let p = bsp.pid();
        let h = bsp.global_alloc(8)?;
        bsp.sync()?;

        if p == 1 {
            bsp.global_put(&[0xaa, 0xbb, 0xcc, 0xdd], h, 2)?;
        }
        bsp.sync()?;

        let mut all = [0u8; 8];
        unsafe { bsp.global_get(h, 0, addr_of_mut(&mut all), 8)? };
        bsp.sync()?;
        bsp.end()?;
        Ok(all)
    });
    for all in results {
        assert_eq!(all, [0, 0, 0xaa, 0xbb, 0xcc, 0xdd, 0, 0]);
    }
    Ok(())
}

/// Handles free and recycle collectively.
#[test]
fn global_free_and_realloc() -> Result<()> {
    run_group(2, |mut bsp| {
        let h1 = bsp.global_alloc(4)?;
        let h2 = bsp.global_alloc(4)?;
        assert_ne!(h1, h2);
        bsp.sync()?;

        bsp.global_free(h1)?;
        bsp.sync()?;

        let h3 = bsp.global_alloc(4)?;
        bsp.sync()?;
        bsp.global_put(&7u32.to_le_bytes(), h3, 0)?;
        bsp.sync()?;

        bsp.global_free(h2)?;
        bsp.global_free(h3)?;
        bsp.sync()?;
        bsp.end()?;
        Ok(())
    });
    Ok(())
}
