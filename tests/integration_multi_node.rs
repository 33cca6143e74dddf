//! Logical processes spread over two nodes: cross-node routing, shared
//! variable initialization and reduction across the transport.

use anyhow::Result;
use bsp_runtime::{addr_of_mut, BspError, ChannelMesh, ContextGroup, SharedDef};

/// Run `f` as every node of a two-node group hosting `nprocs` logical
/// processes.
fn run_nodes<T, F>(nnodes: usize, nprocs: usize, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(ContextGroup) -> bsp_runtime::Result<T> + Send + Sync + Copy + 'static,
{
    let handles: Vec<_> = ChannelMesh::mesh(nnodes)
        .into_iter()
        .map(|tp| {
            std::thread::spawn(move || {
                let group = ContextGroup::new(Box::new(tp), nprocs)?;
                f(group)
            })
        })
        .collect();
    handles
        .into_iter()
        .map(|h| h.join().expect("node panicked").expect("node failed"))
        .collect()
}

/// The multi-node reduce scenario: two nodes of four contexts, each context
/// sets max = 10·node + context_id; the global parent is 13 on every node.
#[test]
fn multi_node_max_reduce() -> Result<()> {
    let results = run_nodes(2, 8, |mut group| {
        group.share("max", SharedDef::<i64>::max())?;
        let node = group.this_node() as i64;
        group.superstep(move |ctx| {
            *ctx.shared_mut::<i64>("max")? = 10 * node + ctx.local_pid() as i64;
            Ok(())
        })?;
        group.reduce_shared()?;
        let got = *group.parent::<i64>("max")?;
        group.end()?;
        Ok(got)
    });
    for got in results {
        assert_eq!(got, 13);
    }
    Ok(())
}

/// Sum reduction over both nodes equals the sequential fold of all child
/// values regardless of placement.
#[test]
fn multi_node_sum_reduce() -> Result<()> {
    let results = run_nodes(2, 8, |mut group| {
        group.share("sum", SharedDef::<u64>::sum())?;
        group.superstep(|ctx| {
            *ctx.shared_mut::<u64>("sum")? = ctx.pid() as u64;
            Ok(())
        })?;
        group.reduce_shared()?;
        let got = *group.parent::<u64>("sum")?;
        group.end()?;
        Ok(got)
    });
    for got in results {
        assert_eq!(got, (0..8).sum::<u64>());
    }
    Ok(())
}

/// Initialization broadcasts the master node's parent value to every child
/// on every node.
#[test]
fn initialize_broadcasts_from_master_node() -> Result<()> {
    let results = run_nodes(2, 6, |mut group| {
        group.share("seed", SharedDef::<i64>::sum())?;
        if group.this_node() == 1 {
            *group.parent_mut::<i64>("seed")? = -7;
        }
        group.initialize_shared(1)?;

        group.superstep(|ctx| {
            assert_eq!(*ctx.shared::<i64>("seed")?, -7);
            Ok(())
        })?;
        let got = *group.parent::<i64>("seed")?;
        group.end()?;
        Ok(got)
    });
    for got in results {
        assert_eq!(got, -7);
    }
    Ok(())
}

/// A put whose target lives on the other node crosses the shared tables
/// and matches the local-path semantics.
#[test]
fn cross_node_put_matches_local_semantics() -> Result<()> {
    let results = run_nodes(2, 4, |mut group| {
        let m = group.procs_this_node();
        let mut values: Vec<u32> = (0..m).map(|l| group.this_node() as u32 * 10 + l as u32).collect();
        let addrs: Vec<usize> = values.iter_mut().map(|v| addr_of_mut(v)).collect();
        let addrs = &addrs;

        group.superstep(move |ctx| {
            unsafe { ctx.push_reg(addrs[ctx.local_pid()], 4)? };
            Ok(())
        })?;

        // Every context writes its pid + 100 into the mirror context, which
        // lives on the other node.
        group.superstep(move |ctx| {
            let p = ctx.pid();
            let target = ctx.nprocs() - 1 - p;
            ctx.put(target, &(100 + p as u32).to_le_bytes(), addrs[ctx.local_pid()], 0)?;
            Ok(())
        })?;

        let node = group.this_node();
        let got = values.clone();
        group.end()?;
        Ok((node, got))
    });
    // Node 0 hosts pids 0..2, node 1 hosts 2..4; the mirror of pid p is
    // 3 - p, so context l on node n receives 100 + (3 - (2n + l)).
    for (node, got) in results {
        match node {
            0 => assert_eq!(got, vec![103, 102]),
            1 => assert_eq!(got, vec![101, 100]),
            _ => unreachable!(),
        }
    }
    Ok(())
}

/// A get whose source lives on the other node goes through the request
/// rewrite and lands at the barrier.
#[test]
fn cross_node_get() -> Result<()> {
    let results = run_nodes(2, 2, |mut group| {
        let mut value: u64 = 1000 + group.this_node() as u64;
        let mut fetched: u64 = 0;
        let va = addr_of_mut(&mut value);
        let fa = addr_of_mut(&mut fetched);

        group.superstep(move |ctx| {
            unsafe { ctx.push_reg(va, 8)? };
            Ok(())
        })?;
        group.superstep(move |ctx| {
            let peer = 1 - ctx.pid();
            unsafe { ctx.get(peer, va, 0, fa, 8)? };
            Ok(())
        })?;

        let node = group.this_node();
        let got = fetched;
        group.end()?;
        Ok((node, got))
    });
    // Node 0 fetched node 1's value and vice versa.
    for (node, got) in results {
        assert_eq!(got, 1000 + (1 - node) as u64);
    }
    Ok(())
}

/// Cross-node BSMP messages carry the logical target id and land in the
/// right context's inbox, FIFO per sender.
#[test]
fn cross_node_bsmp_dispatch() -> Result<()> {
    run_nodes(2, 4, |mut group| {
        group.superstep(|ctx| {
            let mut ts = 4usize;
            ctx.set_tagsize(&mut ts)?;
            Ok(())
        })?;

        group.superstep(|ctx| {
            let p = ctx.pid();
            // Two messages to the mirror context (on the other node).
            let target = ctx.nprocs() - 1 - p;
            ctx.send(target, &(p as u32).to_le_bytes(), &[1, p as u8])?;
            ctx.send(target, &(p as u32).to_le_bytes(), &[2, p as u8])?;
            Ok(())
        })?;

        group.superstep(|ctx| {
            let p = ctx.pid();
            let sender = (ctx.nprocs() - 1 - p) as u32;
            assert_eq!(ctx.qsize(), (2, 4));
            for seq in 1..=2u8 {
                let (len, tag) = ctx.get_tag().expect("message queued");
                assert_eq!(len, 2);
                assert_eq!(u32::from_le_bytes(tag.try_into().unwrap()), sender);
                let mut buf = [0u8; 2];
                assert_eq!(ctx.move_into(&mut buf), 2);
                assert_eq!(buf, [seq, sender as u8]);
            }
            Ok(())
        })?;

        group.end()?;
        Ok(())
    });
    Ok(())
}

/// Registration counts advertised by the two nodes must agree.
#[test]
fn mismatched_registration_across_nodes_is_fatal() {
    let handles: Vec<_> = ChannelMesh::mesh(2)
        .into_iter()
        .map(|tp| {
            std::thread::spawn(move || -> bsp_runtime::Result<()> {
                let mut group = ContextGroup::new(Box::new(tp), 2)?;
                let node = group.this_node();
                let mut slot: u64 = 0;
                let sa = addr_of_mut(&mut slot);
                group.superstep(move |ctx| {
                    // Only node 0's context registers.
                    if node == 0 {
                        unsafe { ctx.push_reg(sa, 8)? };
                    }
                    Ok(())
                })?;
                group.end()
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(results.iter().any(|r| {
        matches!(r, Err(BspError::Registration(_)))
    }));
}
