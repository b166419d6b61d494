// Slot allocator handing out generation-checked ids. Used for model tree nodes, so that per-pass caches can be keyed by
// a plain integer pair instead of by object identity. The seqno counter belongs to the pool, not to the process:
// two pools can hand out equal ids, but one pool never reuses an id, even after remove().

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Id {
    pub slot: usize,
    pub seqno: usize,
}

impl Default for Id {
    fn default() -> Id {
        Id {slot: usize::MAX, seqno: usize::MAX}
    }
}

struct Slot<T> {
    seqno: usize,
    val: Option<T>,
}

pub struct Pool<T> {
    slots: Vec<Slot<T>>,
    vacant: Vec<usize>,
    next_seqno: usize,
    len: usize,
}

impl<T> Pool<T> {
    pub fn new() -> Self {
        Self {slots: Vec::new(), vacant: Vec::new(), next_seqno: 1, len: 0}
    }

    pub fn add(&mut self, x: T) -> (Id, &mut T) {
        let seqno = self.next_seqno;
        self.next_seqno += 1;
        self.len += 1;
        let slot = match self.vacant.pop() {
            Some(slot) => {
                self.slots[slot] = Slot {seqno, val: Some(x)};
                slot
            }
            None => {
                self.slots.push(Slot {seqno, val: Some(x)});
                self.slots.len() - 1
            }
        };
        (Id {slot, seqno}, self.slots[slot].val.as_mut().unwrap())
    }

    pub fn remove(&mut self, id: Id) -> Option<T> {
        let s = match self.slots.get_mut(id.slot) {
            None => return None,
            Some(s) => s };
        if s.seqno != id.seqno {
            return None;
        }
        let v = s.val.take();
        if v.is_some() {
            self.vacant.push(id.slot);
            self.len -= 1;
        }
        v
    }

    pub fn clear(&mut self) {
        for slot in 0..self.slots.len() {
            if self.slots[slot].val.take().is_some() {
                self.vacant.push(slot);
            }
        }
        self.len = 0;
    }

    pub fn len(&self) -> usize { self.len }
    pub fn is_empty(&self) -> bool { self.len == 0 }
    pub fn contains(&self, id: Id) -> bool { self.try_get(id).is_some() }

    pub fn try_get(&self, id: Id) -> Option<&T> {
        let s = self.slots.get(id.slot)?;
        if s.seqno != id.seqno {
            return None;
        }
        s.val.as_ref()
    }

    pub fn try_get_mut(&mut self, id: Id) -> Option<&mut T> {
        let s = self.slots.get_mut(id.slot)?;
        if s.seqno != id.seqno {
            return None;
        }
        s.val.as_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Id, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(slot, s)| s.val.as_ref().map(|v| (Id {slot, seqno: s.seqno}, v)))
    }
}
