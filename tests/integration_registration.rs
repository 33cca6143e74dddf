//! Registration lifecycle: push/pop cycles and collective-order violations.

use anyhow::Result;
use bsp_runtime::{addr_of_mut, Bsp, BspError, ChannelMesh, ContextGroup, SharedDef};

/// The push/pop cycle scenario: register two variables, use one, pop it,
/// then try to use it again.
#[test]
fn push_pop_cycle_then_stale_use() -> Result<()> {
    let handles: Vec<_> = ChannelMesh::mesh(2)
        .into_iter()
        .map(|tp| {
            std::thread::spawn(move || -> bsp_runtime::Result<()> {
                let mut bsp = Bsp::init(Box::new(tp))?;
                let p = bsp.pid();
                let mut a: u32 = 0;
                let mut b: u32 = 0;
                let aa = addr_of_mut(&mut a);
                let ba = addr_of_mut(&mut b);
                // Superstep 1: both processes push a then b.
                unsafe {
                    bsp.push_reg(aa, 4)?;
                    bsp.push_reg(ba, 4)?;
                }
                bsp.sync()?;

                // Superstep 2: put into the peer's b.
                bsp.put(1 - p, &(p as u32 + 1).to_le_bytes(), ba, 0)?;
                bsp.sync()?;
                assert_eq!(b, (1 - p) as u32 + 1);

                // Superstep 3: both pop b.
                bsp.pop_reg(ba)?;
                bsp.sync()?;

                // Superstep 4: a put to b must now be rejected.
                let err = bsp.put(1 - p, &9u32.to_le_bytes(), ba, 0).unwrap_err();
                assert!(matches!(err, BspError::Registration(_)));
                // a is still usable.
                bsp.put(1 - p, &77u32.to_le_bytes(), aa, 0)?;
                bsp.sync()?;
                assert_eq!(a, 77);
                bsp.end()
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap()?;
    }
    Ok(())
}

/// Re-pushing a popped address starts a fresh registration epoch.
#[test]
fn repush_after_pop() -> Result<()> {
    let handles: Vec<_> = ChannelMesh::mesh(2)
        .into_iter()
        .map(|tp| {
            std::thread::spawn(move || -> bsp_runtime::Result<()> {
                let mut bsp = Bsp::init(Box::new(tp))?;
                let p = bsp.pid();
                let mut x: u64 = 0;
                let xa = addr_of_mut(&mut x);
                unsafe { bsp.push_reg(xa, 8)? };
                bsp.sync()?;
                bsp.pop_reg(xa)?;
                unsafe { bsp.push_reg(xa, 8)? };
                bsp.sync()?;

                bsp.put(1 - p, &5u64.to_le_bytes(), xa, 0)?;
                bsp.sync()?;
                assert_eq!(x, 5);
                bsp.end()
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap()?;
    }
    Ok(())
}

/// Co-located contexts disagreeing on how many registrations they issued
/// abort with a registration violation before any exchange.
#[test]
fn mismatched_registration_count_across_contexts() {
    let tp = ChannelMesh::mesh(1).remove(0);
    let mut group = ContextGroup::new(Box::new(tp), 2).unwrap();
    group.share("x", SharedDef::<u64>::sum()).unwrap();

    let mut targets: Vec<u64> = vec![0; 2];
    let addrs: Vec<usize> = targets.iter_mut().map(|t| addr_of_mut(t)).collect();
    let addrs_ref = &addrs;

    let err = group
        .superstep(move |ctx| {
            // Only context 0 registers: a collective-order violation.
            if ctx.local_pid() == 0 {
                unsafe { ctx.push_reg(addrs_ref[ctx.local_pid()], 8)? };
            }
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, BspError::Registration(_)), "got {err}");
}

/// Contexts registering regions of different sizes in the same slot of the
/// collective sequence are detected during the batch validation.
#[test]
fn mismatched_registration_size_across_contexts() {
    let tp = ChannelMesh::mesh(1).remove(0);
    let mut group = ContextGroup::new(Box::new(tp), 2).unwrap();

    let mut targets: Vec<[u64; 2]> = vec![[0; 2]; 2];
    let addrs: Vec<usize> = targets.iter_mut().map(|t| addr_of_mut(t)).collect();
    let addrs_ref = &addrs;

    let err = group
        .superstep(move |ctx| {
            let nbytes = if ctx.local_pid() == 0 { 8 } else { 16 };
            unsafe { ctx.push_reg(addrs_ref[ctx.local_pid()], nbytes)? };
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, BspError::Registration(_)), "got {err}");
}

/// A context pop of an address that was never pushed fails immediately.
#[test]
fn context_pop_without_push_fails() {
    let tp = ChannelMesh::mesh(1).remove(0);
    let mut group = ContextGroup::new(Box::new(tp), 2).unwrap();
    let err = group
        .superstep(|ctx| ctx.pop_reg(0xdead_0000))
        .unwrap_err();
    assert!(matches!(err, BspError::Registration(_)), "got {err}");
}
