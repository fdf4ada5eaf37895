/// Disjoint sets over `0..len`, with union by rank and path compression
#[derive(Clone, Debug, Default)]
pub struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    pub fn new() -> UnionFind {
        UnionFind::default()
    }

    /// Add a new singleton set, returning its element
    pub fn add(&mut self) -> usize {
        let element = self.parent.len();
        self.parent.push(element);
        self.rank.push(0);
        element
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    /// Representative of the set containing `element`
    pub fn find(&mut self, element: usize) -> usize {
        let mut root = element;
        while self.parent[root] != root {
            root = self.parent[root];
        }

        // Point everything on the path straight at the root
        let mut cursor = element;
        while self.parent[cursor] != root {
            let next = self.parent[cursor];
            self.parent[cursor] = root;
            cursor = next;
        }
        root
    }

    /// Merge the sets of `a` and `b`, returning the representative of the result
    pub fn union(&mut self, a: usize, b: usize) -> usize {
        let (a, b) = (self.find(a), self.find(b));
        if a == b {
            return a;
        }
        let (root, child) = match self.rank[a].cmp(&self.rank[b]) {
            std::cmp::Ordering::Less => (b, a),
            std::cmp::Ordering::Greater => (a, b),
            std::cmp::Ordering::Equal => {
                self.rank[a] += 1;
                (a, b)
            }
        };
        self.parent[child] = root;
        root
    }

    pub fn same(&mut self, a: usize, b: usize) -> bool {
        self.find(a) == self.find(b)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unions_are_transitive() {
        let mut sets = UnionFind::new();
        let elements: Vec<usize> = (0..6).map(|_| sets.add()).collect();
        assert_eq!(sets.len(), 6);

        sets.union(elements[0], elements[1]);
        sets.union(elements[2], elements[3]);
        assert!(!sets.same(elements[1], elements[2]));
        let root = sets.union(elements[3], elements[1]);
        for element in &elements[..4] {
            assert_eq!(sets.find(*element), root);
        }
        assert!(!sets.same(elements[4], elements[5]));
        assert_eq!(sets.find(elements[5]), elements[5]);
    }
}
