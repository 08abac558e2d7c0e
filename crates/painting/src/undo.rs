//! Undo ledger for brush strokes
//!
//! A stroke captures the tiles it is about to touch, once each, before the
//! first write to them. Captures are GPU copies recorded ahead of the dab
//! that paints over them, into transfer buffers the ledger owns, so painting
//! never waits on the queue. Committed strokes go into a bounded ring (entry
//! count and snapshot bytes); the oldest entries are evicted for good. Undo
//! queues a swap of the captured texels with the live ones so the same
//! entry can be redone.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, warn};

use crate::constants::{TEXEL_SIZE, UNDO_TILE_SIZE};
use crate::device::{BufferDesc, BufferHandle, Command, CommandBuffer, GpuDevice, MemoryKind};
use crate::error::{PaintError, PaintResult};
use crate::layers::LayerStack;
use crate::types::{EntryHandle, LayerId, Region, TileCoord};

/// Texels of one region held in a ledger-owned transfer buffer. Before an
/// undo these are the pre-stroke texels, after it the texels it replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub region: Region,
    pub buffer: BufferHandle,
}

impl Snapshot {
    pub fn byte_size(&self) -> u64 {
        self.region.byte_len(TEXEL_SIZE)
    }

    /// Host readback of the stored texels. Reflects the queued copies that
    /// have retired so far.
    pub fn read(&self, device: &dyn GpuDevice) -> PaintResult<Vec<u8>> {
        Ok(device.read_buffer(self.buffer, 0, self.byte_size())?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoEntry {
    pub layer: LayerId,
    pub sequence: u64,
    pub snapshots: Vec<Snapshot>,
}

impl UndoEntry {
    pub fn byte_size(&self) -> u64 {
        self.snapshots.iter().map(Snapshot::byte_size).sum()
    }

    fn release(self, device: &mut dyn GpuDevice) {
        release_snapshots(device, self.snapshots);
    }
}

#[derive(Debug)]
struct PendingStroke {
    layer: LayerId,
    captured: HashSet<TileCoord>,
    snapshots: Vec<Snapshot>,
}

#[derive(Debug)]
pub struct UndoLedger {
    capacity: usize,
    byte_budget: u64,
    /// Oldest first
    entries: VecDeque<UndoEntry>,
    /// Most recently undone last
    redo: Vec<UndoEntry>,
    pending: HashMap<EntryHandle, PendingStroke>,
    bytes: u64,
    next_handle: u64,
    next_sequence: u64,
}

impl UndoLedger {
    pub fn new(capacity: usize, byte_budget: u64) -> Self {
        Self {
            capacity,
            byte_budget,
            entries: VecDeque::with_capacity(capacity),
            redo: Vec::new(),
            pending: HashMap::new(),
            bytes: 0,
            next_handle: 1,
            next_sequence: 1,
        }
    }

    /// Start a stroke on `layer`. Copies of `region` are recorded into
    /// `commands`, which must be submitted ahead of the write.
    pub fn begin_stroke(
        &mut self,
        device: &mut dyn GpuDevice,
        layers: &LayerStack,
        layer: LayerId,
        region: Region,
        commands: &mut CommandBuffer,
    ) -> PaintResult<EntryHandle> {
        let mut stroke = PendingStroke {
            layer,
            captured: HashSet::new(),
            snapshots: Vec::new(),
        };
        capture(device, layers, &mut stroke, region, commands)?;

        let handle = EntryHandle(self.next_handle);
        self.next_handle += 1;
        debug!(
            "Began stroke {:?} on layer {} ({} tiles)",
            handle,
            layer,
            stroke.snapshots.len()
        );
        self.pending.insert(handle, stroke);
        Ok(handle)
    }

    /// Record copies of the tiles of `region` the stroke has not touched yet
    pub fn extend_stroke(
        &mut self,
        device: &mut dyn GpuDevice,
        layers: &LayerStack,
        handle: EntryHandle,
        region: Region,
        commands: &mut CommandBuffer,
    ) -> PaintResult<()> {
        let stroke = self
            .pending
            .get_mut(&handle)
            .ok_or(PaintError::InvalidEntry(handle.0))?;
        capture(device, layers, stroke, region, commands)
    }

    /// Drop a pending stroke without recording it
    pub fn abort_stroke(&mut self, device: &mut dyn GpuDevice, handle: EntryHandle) -> bool {
        match self.pending.remove(&handle) {
            Some(stroke) => {
                release_snapshots(device, stroke.snapshots);
                true
            }
            None => false,
        }
    }

    /// Record a pending stroke. Returns its sequence number, or `None` when
    /// the stroke captured nothing or is larger than the whole byte budget.
    pub fn commit_stroke(&mut self, device: &mut dyn GpuDevice, handle: EntryHandle) -> PaintResult<Option<u64>> {
        let stroke = self
            .pending
            .remove(&handle)
            .ok_or(PaintError::InvalidEntry(handle.0))?;
        // The layer changed, so whatever was undone can no longer be redone
        for entry in self.redo.drain(..) {
            entry.release(device);
        }

        if stroke.snapshots.is_empty() {
            return Ok(None);
        }
        let entry = UndoEntry {
            layer: stroke.layer,
            sequence: self.next_sequence,
            snapshots: stroke.snapshots,
        };
        self.next_sequence += 1;

        let size = entry.byte_size();
        if self.capacity == 0 || size > self.byte_budget {
            warn!(
                "Stroke {} on layer {} needs {} bytes (budget {}); not undoable",
                entry.sequence, entry.layer, size, self.byte_budget
            );
            entry.release(device);
            return Ok(None);
        }

        while self.entries.len() >= self.capacity || self.bytes + size > self.byte_budget {
            let Some(evicted) = self.entries.pop_front() else {
                break;
            };
            self.bytes -= evicted.byte_size();
            warn!("Undo ledger full, evicted stroke {}", evicted.sequence);
            evicted.release(device);
        }

        debug!(
            "Committed stroke {} on layer {} ({} bytes)",
            entry.sequence, entry.layer, size
        );
        self.bytes += size;
        let sequence = entry.sequence;
        self.entries.push_back(entry);
        Ok(Some(sequence))
    }

    /// Revert the newest stroke. `false` when there is nothing to undo.
    pub fn undo(&mut self, device: &mut dyn GpuDevice, layers: &LayerStack) -> PaintResult<bool> {
        let Some(entry) = self.entries.back() else {
            debug!("Undo: no entries available");
            return Ok(false);
        };
        debug!("Undoing stroke {} ({} regions)", entry.sequence, entry.snapshots.len());
        swap(device, layers, entry)?;
        if let Some(entry) = self.entries.pop_back() {
            self.bytes -= entry.byte_size();
            self.redo.push(entry);
        }
        Ok(true)
    }

    /// Reapply the most recently undone stroke. `false` when there is none.
    pub fn redo(&mut self, device: &mut dyn GpuDevice, layers: &LayerStack) -> PaintResult<bool> {
        let Some(entry) = self.redo.last() else {
            debug!("Redo: no entries available");
            return Ok(false);
        };
        debug!("Redoing stroke {}", entry.sequence);
        swap(device, layers, entry)?;
        if let Some(entry) = self.redo.pop() {
            self.bytes += entry.byte_size();
            self.entries.push_back(entry);
        }
        Ok(true)
    }

    /// Purge every entry that references `layer`. Returns how many went.
    pub fn forget_layer(&mut self, device: &mut dyn GpuDevice, layer: LayerId) -> usize {
        let mut removed = 0;
        let entries = std::mem::take(&mut self.entries);
        for entry in entries {
            if entry.layer == layer {
                entry.release(device);
                removed += 1;
            } else {
                self.entries.push_back(entry);
            }
        }
        let redo = std::mem::take(&mut self.redo);
        for entry in redo {
            if entry.layer == layer {
                entry.release(device);
                removed += 1;
            } else {
                self.redo.push(entry);
            }
        }
        let stale: Vec<_> = self
            .pending
            .iter()
            .filter(|(_, stroke)| stroke.layer == layer)
            .map(|(&handle, _)| handle)
            .collect();
        for handle in stale {
            self.abort_stroke(device, handle);
            removed += 1;
        }

        self.bytes = self.entries.iter().map(UndoEntry::byte_size).sum();
        if removed > 0 {
            debug!("Purged {} undo entries for layer {}", removed, layer);
        }
        removed
    }

    /// Free every snapshot buffer, pending strokes included
    pub fn release(&mut self, device: &mut dyn GpuDevice) {
        for entry in self.entries.drain(..).chain(self.redo.drain(..)) {
            entry.release(device);
        }
        for (_, stroke) in self.pending.drain() {
            release_snapshots(device, stroke.snapshots);
        }
        self.bytes = 0;
    }

    pub fn is_pending(&self, handle: EntryHandle) -> bool {
        self.pending.contains_key(&handle)
    }

    pub fn can_undo(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn redo_len(&self) -> usize {
        self.redo.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshot bytes held by committed entries
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Committed entries, oldest first
    pub fn entries(&self) -> impl Iterator<Item = &UndoEntry> {
        self.entries.iter()
    }
}

fn release_snapshots(device: &mut dyn GpuDevice, snapshots: Vec<Snapshot>) {
    for snapshot in snapshots {
        device.destroy_buffer(snapshot.buffer);
    }
}

fn capture(
    device: &mut dyn GpuDevice,
    layers: &LayerStack,
    stroke: &mut PendingStroke,
    region: Region,
    commands: &mut CommandBuffer,
) -> PaintResult<()> {
    let texture = layers.texture(stroke.layer)?;
    let full = layers.full_region();
    let Some(region) = region.intersect(&full) else {
        return Ok(());
    };

    let cells: Vec<_> = region
        .tiles(UNDO_TILE_SIZE)
        .filter(|(coord, _)| !stroke.captured.contains(coord))
        .filter_map(|(coord, _)| {
            Region::new(
                coord.x * UNDO_TILE_SIZE,
                coord.y * UNDO_TILE_SIZE,
                UNDO_TILE_SIZE,
                UNDO_TILE_SIZE,
            )
            .intersect(&full)
            .map(|cell| (coord, cell))
        })
        .collect();

    // All or nothing, so a failed allocation leaves no unfilled snapshot behind
    let mut snapshots = Vec::with_capacity(cells.len());
    for &(_, cell) in &cells {
        let desc = BufferDesc {
            size: cell.byte_len(TEXEL_SIZE),
            memory: MemoryKind::HostTransfer,
        };
        match device.create_buffer(&desc) {
            Ok(buffer) => snapshots.push(Snapshot { region: cell, buffer }),
            Err(err) => {
                release_snapshots(device, snapshots);
                return Err(err.into());
            }
        }
    }

    for ((coord, _), snapshot) in cells.into_iter().zip(snapshots) {
        commands.record(Command::CopyRegionToBuffer {
            texture,
            region: snapshot.region,
            buffer: snapshot.buffer,
            offset: 0,
        });
        stroke.snapshots.push(snapshot);
        stroke.captured.insert(coord);
    }
    Ok(())
}

/// Queue an exchange of the entry's stored texels with the live ones
fn swap(device: &mut dyn GpuDevice, layers: &LayerStack, entry: &UndoEntry) -> PaintResult<()> {
    // Entries are purged with their layer
    let texture = layers.texture(entry.layer).map_err(|_| {
        PaintError::LedgerCorrupted(format!("entry {} targets freed layer {}", entry.sequence, entry.layer))
    })?;

    let mut commands = CommandBuffer::new();
    for snapshot in &entry.snapshots {
        commands.record(Command::SwapRegionWithBuffer {
            texture,
            region: snapshot.region,
            buffer: snapshot.buffer,
            offset: 0,
        });
    }
    device
        .submit(commands.submission(Vec::new(), Vec::new(), None))
        .map_err(|err| PaintError::SubmissionFailed(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CpuDevice, Exportable, ExternalSync, TextureDesc};
    use painter_config::TextureTier;

    const SIZE: u32 = 128;

    fn setup() -> (CpuDevice, LayerStack, LayerId) {
        let mut device = CpuDevice::new(TextureTier::K4.memory_budget());
        let mut layers = LayerStack::new(SIZE, 4);
        let layer = layers.create(&mut device).unwrap();
        (device, layers, layer)
    }

    fn submit(device: &mut CpuDevice, commands: &CommandBuffer) {
        device.submit(commands.submission(vec![], vec![], None)).unwrap();
    }

    fn begin(
        ledger: &mut UndoLedger,
        device: &mut CpuDevice,
        layers: &LayerStack,
        layer: LayerId,
        region: Region,
    ) -> EntryHandle {
        let mut commands = CommandBuffer::new();
        let handle = ledger.begin_stroke(device, layers, layer, region, &mut commands).unwrap();
        submit(device, &commands);
        handle
    }

    fn extend(
        ledger: &mut UndoLedger,
        device: &mut CpuDevice,
        layers: &LayerStack,
        handle: EntryHandle,
        region: Region,
    ) {
        let mut commands = CommandBuffer::new();
        ledger
            .extend_stroke(device, layers, handle, region, &mut commands)
            .unwrap();
        submit(device, &commands);
    }

    fn fill(device: &mut CpuDevice, layers: &LayerStack, layer: LayerId, region: Region, value: u8) {
        let texture = layers.texture(layer).unwrap();
        let data = vec![value; region.byte_len(TEXEL_SIZE) as usize];
        device.write_region(texture, region, &data).unwrap();
    }

    fn read(device: &mut CpuDevice, layers: &LayerStack, layer: LayerId, region: Region) -> Vec<u8> {
        device.read_region(layers.texture(layer).unwrap(), region).unwrap()
    }

    fn paint(
        ledger: &mut UndoLedger,
        device: &mut CpuDevice,
        layers: &LayerStack,
        layer: LayerId,
        region: Region,
        value: u8,
    ) -> Option<u64> {
        let handle = begin(ledger, device, layers, layer, region);
        fill(device, layers, layer, region, value);
        ledger.commit_stroke(device, handle).unwrap()
    }

    #[test]
    fn test_undo_redo_roundtrip() {
        let (mut device, layers, layer) = setup();
        let mut ledger = UndoLedger::new(8, u64::MAX);
        let region = Region::new(10, 10, 20, 20);
        fill(&mut device, &layers, layer, layers.full_region(), 3);

        paint(&mut ledger, &mut device, &layers, layer, region, 200);
        let painted = read(&mut device, &layers, layer, layers.full_region());

        assert!(ledger.undo(&mut device, &layers).unwrap());
        assert!(read(&mut device, &layers, layer, layers.full_region()).iter().all(|&b| b == 3));

        assert!(ledger.redo(&mut device, &layers).unwrap());
        assert_eq!(read(&mut device, &layers, layer, layers.full_region()), painted);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_snapshot_holds_pre_stroke_texels() {
        let (mut device, layers, layer) = setup();
        let mut ledger = UndoLedger::new(8, u64::MAX);
        fill(&mut device, &layers, layer, layers.full_region(), 9);
        paint(&mut ledger, &mut device, &layers, layer, Region::new(0, 0, 4, 4), 100);

        let entry = ledger.entries().next().unwrap();
        let snapshot = entry.snapshots[0];
        assert_eq!(snapshot.region, Region::new(0, 0, UNDO_TILE_SIZE, UNDO_TILE_SIZE));
        assert!(snapshot.read(&device).unwrap().iter().all(|&b| b == 9));
    }

    #[test]
    fn test_exhausted_undo_and_redo_are_noops() {
        let (mut device, layers, _) = setup();
        let mut ledger = UndoLedger::new(4, u64::MAX);
        assert!(!ledger.undo(&mut device, &layers).unwrap());
        assert!(!ledger.redo(&mut device, &layers).unwrap());
    }

    #[test]
    fn test_new_stroke_clears_redo() {
        let (mut device, layers, layer) = setup();
        let mut ledger = UndoLedger::new(8, u64::MAX);
        paint(&mut ledger, &mut device, &layers, layer, Region::new(0, 0, 4, 4), 50);
        assert!(ledger.undo(&mut device, &layers).unwrap());
        assert!(ledger.can_redo());

        paint(&mut ledger, &mut device, &layers, layer, Region::new(8, 8, 4, 4), 60);
        assert!(!ledger.redo(&mut device, &layers).unwrap());

        // Only the live entry still holds a snapshot buffer
        let tile_bytes = u64::from(UNDO_TILE_SIZE * UNDO_TILE_SIZE * TEXEL_SIZE);
        assert_eq!(device.memory_used(MemoryKind::HostTransfer), tile_bytes);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let (mut device, layers, layer) = setup();
        let mut ledger = UndoLedger::new(3, u64::MAX);
        let sequences: Vec<_> = (0..4)
            .map(|i| paint(&mut ledger, &mut device, &layers, layer, Region::new(0, 0, 2, 2), i).unwrap())
            .collect();

        assert_eq!(ledger.len(), 3);
        let kept: Vec<_> = ledger.entries().map(|e| e.sequence).collect();
        assert_eq!(kept, &sequences[1..]);
    }

    #[test]
    fn test_byte_budget_evicts_and_rejects_oversize() {
        let (mut device, layers, layer) = setup();
        let tile_bytes = (UNDO_TILE_SIZE * UNDO_TILE_SIZE * TEXEL_SIZE) as u64;
        let mut ledger = UndoLedger::new(16, tile_bytes * 2);

        paint(&mut ledger, &mut device, &layers, layer, Region::new(0, 0, 2, 2), 1);
        paint(&mut ledger, &mut device, &layers, layer, Region::new(0, 0, 2, 2), 2);
        paint(&mut ledger, &mut device, &layers, layer, Region::new(0, 0, 2, 2), 3);
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.bytes(), tile_bytes * 2);

        // Touches four tiles: larger than the whole budget
        let oversize = paint(&mut ledger, &mut device, &layers, layer, layers.full_region(), 4);
        assert_eq!(oversize, None);
        assert_eq!(ledger.len(), 2);
        assert_eq!(device.memory_used(MemoryKind::HostTransfer), tile_bytes * 2);
    }

    #[test]
    fn test_tiles_captured_once_per_stroke() {
        let (mut device, layers, layer) = setup();
        let mut ledger = UndoLedger::new(8, u64::MAX);
        let handle = begin(&mut ledger, &mut device, &layers, layer, Region::new(0, 0, 8, 8));
        fill(&mut device, &layers, layer, Region::new(0, 0, 8, 8), 90);
        // Same tile again: the already-painted texels must not be recaptured
        extend(&mut ledger, &mut device, &layers, handle, Region::new(4, 4, 8, 8));
        extend(&mut ledger, &mut device, &layers, handle, Region::new(70, 0, 4, 4));
        ledger.commit_stroke(&mut device, handle).unwrap();

        let entry = ledger.entries().next().unwrap();
        assert_eq!(entry.snapshots.len(), 2);
        assert!(ledger.undo(&mut device, &layers).unwrap());
        assert!(read(&mut device, &layers, layer, Region::new(0, 0, 8, 8)).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_abort_and_unknown_handles() {
        let (mut device, layers, layer) = setup();
        let mut ledger = UndoLedger::new(8, u64::MAX);
        let handle = begin(&mut ledger, &mut device, &layers, layer, Region::new(0, 0, 1, 1));
        assert!(ledger.is_pending(handle));
        assert!(ledger.abort_stroke(&mut device, handle));
        assert!(matches!(
            ledger.commit_stroke(&mut device, handle),
            Err(PaintError::InvalidEntry(_))
        ));
        assert!(ledger.is_empty());
        assert_eq!(device.memory_used(MemoryKind::HostTransfer), 0);
    }

    #[test]
    fn test_forget_layer_purges_entries() {
        let (mut device, mut layers, a) = setup();
        let b = layers.create(&mut device).unwrap();
        let mut ledger = UndoLedger::new(8, u64::MAX);
        paint(&mut ledger, &mut device, &layers, a, Region::new(0, 0, 2, 2), 1);
        paint(&mut ledger, &mut device, &layers, b, Region::new(0, 0, 2, 2), 2);
        paint(&mut ledger, &mut device, &layers, a, Region::new(0, 0, 2, 2), 3);

        assert_eq!(ledger.forget_layer(&mut device, a), 2);
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.entries().next().unwrap().layer, b);

        ledger.release(&mut device);
        assert!(ledger.is_empty());
        assert_eq!(device.memory_used(MemoryKind::HostTransfer), 0);
    }

    #[test]
    fn test_stroke_and_undo_queue_behind_stalled_work() {
        let (mut device, layers, layer) = setup();
        let mut ledger = UndoLedger::new(8, u64::MAX);
        let texture = layers.texture(layer).unwrap();

        // Work waiting on a consumer that has not released its frame yet
        let other = device.create_texture(&TextureDesc::rgba8(4, 4)).unwrap();
        let read_done = device.create_semaphore(true).unwrap();
        let mut stalled = CommandBuffer::new();
        stalled.record(Command::ClearColor {
            texture: other,
            color: [1.0; 4],
        });
        device.submit(stalled.submission(vec![read_done], vec![], None)).unwrap();

        let mut commands = CommandBuffer::new();
        let handle = ledger
            .begin_stroke(&mut device, &layers, layer, layers.full_region(), &mut commands)
            .unwrap();
        commands.record(Command::ClearColor {
            texture,
            color: [1.0; 4],
        });
        submit(&mut device, &commands);
        assert!(ledger.commit_stroke(&mut device, handle).unwrap().is_some());
        assert!(ledger.undo(&mut device, &layers).unwrap());
        assert_eq!(device.pending_work(), 3);

        let handle = device.export_handle(Exportable::Semaphore(read_done)).unwrap();
        device.import_and_signal(handle).unwrap();
        assert!(read(&mut device, &layers, layer, layers.full_region()).iter().all(|&b| b == 0));

        assert!(ledger.redo(&mut device, &layers).unwrap());
        assert!(read(&mut device, &layers, layer, layers.full_region()).iter().all(|&b| b == 255));
    }
}
