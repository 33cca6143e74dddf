//! Bulk-synchronous message passing over an in-process group.

use anyhow::Result;
use bsp_runtime::{Bsp, ChannelMesh};

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

/// The circular-send scenario: P = 3, tag size 4; rank p sends tag p,
/// payload 10·p to (p + 1) mod 3.
#[test]
fn circular_send() -> Result<()> {
    let results = run_group(3, |mut bsp| {
        let p = bsp.pid();
        let mut ts = 4usize;
        bsp.set_tagsize(&mut ts)?;
        assert_eq!(ts, 0);
        bsp.sync()?;

        bsp.send(
            (p + 1) % 3,
            &(p as u32).to_le_bytes(),
            &(10 * p as u32).to_le_bytes(),
        )?;
        bsp.sync()?;

        let (n, bytes) = bsp.qsize();
        assert_eq!((n, bytes), (1, 4));
        let (payload_len, tag) = bsp.get_tag().expect("one message queued");
        assert_eq!(payload_len, 4);
        let tag = u32::from_le_bytes(tag.try_into().unwrap());
        let mut payload = [0u8; 4];
        assert_eq!(bsp.move_into(&mut payload), 4);
        let payload = u32::from_le_bytes(payload);
        bsp.end()?;
        Ok((p, tag, payload))
    });
    for (p, tag, payload) in results {
        let sender = (p + 2) % 3;
        assert_eq!(tag as usize, sender);
        assert_eq!(payload as usize, 10 * sender);
    }
    Ok(())
}

/// Messages from one sender arrive in issue order, and qsize counts down
/// as they are consumed.
#[test]
fn fifo_per_sender() -> Result<()> {
    let results = run_group(2, |mut bsp| {
        let p = bsp.pid();
        bsp.sync()?;

        for i in 0..5u32 {
            bsp.send(1 - p, &[], &(100 * p as u32 + i).to_le_bytes())?;
        }
        bsp.sync()?;

        assert_eq!(bsp.qsize(), (5, 20));
        let mut seen = Vec::new();
        while let Some((_, payload)) = bsp.hpmove() {
            seen.push(u32::from_le_bytes(payload.try_into().unwrap()));
        }
        assert_eq!(bsp.qsize(), (0, 0));
        bsp.end()?;
        Ok((p, seen))
    });
    for (p, seen) in results {
        let sender = 1 - p;
        let expect: Vec<u32> = (0..5).map(|i| 100 * sender as u32 + i).collect();
        assert_eq!(seen, expect);
    }
    Ok(())
}

/// A tag-size change takes effect for sends of the following superstep;
/// the inbox window keeps the size its messages were sent with.
#[test]
fn tagsize_change_is_deferred() -> Result<()> {
    run_group(2, |mut bsp| {
        let p = bsp.pid();
        // Superstep 0: no tag yet, queue one tagless message.
        bsp.send(1 - p, &[], &[1])?;
        let mut ts = 8usize;
        bsp.set_tagsize(&mut ts)?;
        assert_eq!(ts, 0, "previous size reported");
        bsp.sync()?;

        // Superstep 1: the inbox still reads tagless messages, while new
        // sends carry 8-byte tags.
        let (_, tag) = bsp.get_tag().expect("tagless message");
        assert!(tag.is_empty());
        let mut sink = [0u8; 1];
        bsp.move_into(&mut sink);
        bsp.send(1 - p, &(p as u64).to_le_bytes(), &[2])?;
        bsp.sync()?;

        // Superstep 2: the window delivers the tagged message.
        let (payload_len, tag) = bsp.get_tag().expect("tagged message");
        assert_eq!(payload_len, 1);
        assert_eq!(u64::from_le_bytes(tag.try_into().unwrap()), 1 - p as u64);
        bsp.end()?;
        Ok(())
    });
    Ok(())
}

/// Unconsumed messages are dropped when the next window opens.
#[test]
fn unread_messages_are_dropped_at_the_barrier() -> Result<()> {
    run_group(2, |mut bsp| {
        let p = bsp.pid();
        bsp.sync()?;
        bsp.send(1 - p, &[], &[9, 9])?;
        bsp.sync()?;
        assert_eq!(bsp.qsize(), (1, 2));
        // Consume nothing.
        bsp.sync()?;
        assert_eq!(bsp.qsize(), (0, 0));
        assert!(bsp.get_tag().is_none());
        bsp.end()?;
        Ok(())
    });
    Ok(())
}

/// `move_into` truncates to the caller's buffer but still consumes the
/// message.
#[test]
fn move_truncates_but_consumes() -> Result<()> {
    run_group(2, |mut bsp| {
        let p = bsp.pid();
        bsp.sync()?;
        bsp.send(1 - p, &[], &[1, 2, 3, 4, 5, 6])?;
        bsp.sync()?;

        let mut buf = [0u8; 3];
        assert_eq!(bsp.move_into(&mut buf), 3);
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(bsp.qsize(), (0, 0));
        bsp.end()?;
        Ok(())
    });
    Ok(())
}
