use rayon::iter::{FromParallelIterator, IntoParallelIterator, ParallelExtend, ParallelIterator};

use crate::map::ConcurrentLongMap;

impl<V> ParallelExtend<(i64, V)> for &ConcurrentLongMap<V>
where
    V: Send + Sync,
{
    fn par_extend<I>(&mut self, par_iter: I)
    where
        I: IntoParallelIterator<Item = (i64, V)>,
    {
        let map = &**self;
        par_iter.into_par_iter().for_each(|(key, value)| {
            let guard = &crossbeam_epoch::pin();
            map.put_val(key, value, false, guard);
        });
    }
}

impl<V> FromParallelIterator<(i64, V)> for ConcurrentLongMap<V>
where
    V: Send + Sync,
{
    fn from_par_iter<I>(par_iter: I) -> Self
    where
        I: IntoParallelIterator<Item = (i64, V)>,
    {
        let map = ConcurrentLongMap::new();
        (&map).par_extend(par_iter);
        map
    }
}
